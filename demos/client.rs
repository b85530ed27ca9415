// s7audit - S7comm diagnostic client for Siemens PLCs.
// Copyright 2025 - Davide Nardella

use std::env;
use std::time::Duration;

use s7audit::simulator::{block_image, SimulatedPlc};
use s7audit::{
    Area, BlockType, CancelToken, ClientConfig, Connector, S7Client, S7Result, SessionParams, SessionPool, TypedValue,
    WordLen,
};
use tracing_subscriber::EnvFilter;

const DB_NUMBER: u16 = 100; // Must exist into the PLC

fn print_dump(data: &[u8]) {
    for (i, chunk) in data.chunks(32).enumerate() {
        print!("{:04X}: ", i * 32); // Hex Offset
        for byte in chunk {
            print!("{:02X} ", byte);
        }
        println!();
    }
}

fn report<C: Connector>(client: &S7Client<C>) {
    println!("Success!");
    println!("Job time (ms) : {:.3}", client.last_time);
    println!("Chunks        : {}", client.chunks);
}

fn run<C: Connector>(client: &mut S7Client<C>) -> S7Result<()> {
    client.connect()?;
    println!("Connected to PLC");
    println!("PDU negotiated: {} byte", client.pdu_size());
    println!("Job time (ms) : {:.3}", client.last_time);

    println!();
    println!("Attempt to read 462 byte from DB{}", DB_NUMBER);
    match client.read_db(DB_NUMBER, 0, 462) {
        Ok(data) => {
            report(client);
            print_dump(&data);
        }
        Err(e) => eprintln!("Read failed: {}", e),
    }

    println!();
    println!("Attempt to write 1024 byte to DB{}", DB_NUMBER);
    let write_data: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();
    match client.write_db(DB_NUMBER, 0, &write_data) {
        Ok(()) => report(client),
        Err(e) => eprintln!("Write failed: {}", e),
    }

    println!();
    println!("Attempt to write 'true' into DB{}.DBX16.0", DB_NUMBER);
    match client.write_bit(Area::DataBlock, Some(DB_NUMBER), 16, 0, true) {
        Ok(written) => {
            report(client);
            println!("Byte before   : {:?}", written.previous);
            println!("Byte written  : {:02X?}", written.written);
        }
        Err(e) => eprintln!("Write failed: {}", e),
    }

    println!();
    println!("Attempt to read MD20 as Real");
    match client.read_area(Area::Marker, None, 20, 0, WordLen::Real) {
        Ok(value) => {
            report(client);
            println!("Value read    : {}", value);
        }
        Err(e) => eprintln!("Read failed: {}", e),
    }

    println!();
    println!("Attempt to copy OB1 into OB35");
    match client.copy(1) {
        Ok(image) => {
            report(client);
            println!("OB1 size      : {} byte", image.len());
            match client.paste(&image, 35) {
                Ok(()) => report(client),
                Err(e) => eprintln!("Download failed: {}", e),
            }
        }
        Err(e) => eprintln!("Upload failed: {}", e),
    }

    client.disconnect();
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let result = match env::args().nth(1) {
        Some(host) => S7Client::new(ClientConfig::s71200_1500(host)).and_then(|mut client| run(&mut client)),
        None => {
            println!("No host given, using the simulator");
            let plc = SimulatedPlc::new()
                .with_db(DB_NUMBER, 1024)
                .with_block(BlockType::Ob, 1, block_image(BlockType::Ob, 1, 1200));
            plc.set_memory(Area::Marker, 0, 20, &TypedValue::Real(3.5).to_bytes());
            let mut client = S7Client::with_connector(ClientConfig::new("sim"), plc.connector());
            let result = run(&mut client);

            println!();
            println!("Holding 4 connections for 100 ms");
            let mut pool = SessionPool::new(plc.connector(), SessionParams::from(client.config()));
            let cancel = CancelToken::new();
            let stopper = cancel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                stopper.cancel();
            });
            let held = pool.hold_connections(4, &cancel);
            println!("Opened        : {}/{}", held.opened, held.requested);
            result
        }
    };

    if let Err(e) = result {
        eprintln!("Failed: {}", e);
    }
}
