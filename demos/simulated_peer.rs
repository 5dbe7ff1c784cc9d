use anyhow::{anyhow, Context, Result};
use clap::{App, Arg};
use log::*;
use macaddr::MacAddr6;
use std::thread;
use std::time::Duration;
use ble_central::central::*;
use ble_central::mock::*;

fn parse_args() -> Result<(PeerAddress, Vec<u8>, Vec<Vec<u8>>, u16)> {
    let matches = App::new("simulated_peer")
        .about("Runs a central session against an in-memory peripheral")
        .arg(Arg::with_name("address")
            .long("address")
            .takes_value(true)
            .default_value("AA:BB:CC:DD:EE:FF")
            .help("MAC address of the simulated peer"))
        .arg(Arg::with_name("payload")
            .long("payload")
            .takes_value(true)
            .default_value("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f2021222324252627")
            .help("Hex payload written to the peer"))
        .arg(Arg::with_name("packets")
            .long("packets")
            .takes_value(true)
            .multiple(true)
            .default_value("68656c6c6f2c20")
            .help("Hex packets the peer answers a read with, the first one as the read response"))
        .arg(Arg::with_name("mtu")
            .long("mtu")
            .takes_value(true)
            .default_value("185")
            .help("Transfer unit to negotiate"))
        .get_matches();

    let address: MacAddr6 = matches.value_of("address").unwrap_or_default().parse()
        .map_err(|e| anyhow!("invalid address: {:?}", e))?;
    let payload = hex::decode(matches.value_of("payload").unwrap_or_default())
        .context("invalid payload")?;
    let packets = matches.values_of("packets").into_iter().flatten()
        .map(|p| hex::decode(p).context("invalid packet"))
        .collect::<Result<Vec<_>>>()?;
    let mtu = matches.value_of("mtu").unwrap_or_default().parse().context("invalid mtu")?;
    Ok((PeerAddress::new(address.to_string()), payload, packets, mtu))
}

pub fn main() -> Result<()> {
    env_logger::init();

    let (address, payload, packets, mtu) = parse_args()?;
    let total: usize = packets.iter().map(|p| p.len()).sum();

    let transport = MockTransport::new()
        .with_read_response(DEFAULT_CHARACTERISTIC, packets)
        .with_write_response(DEFAULT_CHARACTERISTIC, vec![b"ok".to_vec()]);
    let central = CentralManager::builder()
        .write_chunk_size(20)
        .build(transport.clone())?;

    let events = central.events();
    let printer = thread::spawn(move || {
        for event in events.iter() {
            let now = chrono::Local::now().format("[%Y-%m-%d %H:%M:%S%.3f]");
            match (event.address(), event.payload(), event.error_message()) {
                (Some(a), Some(p), _) => println!("{} {:?} {}: {}", now, event.kind(), a, hex::encode(p)),
                (Some(a), None, Some(e)) => println!("{} {:?} {}: {}", now, event.kind(), a, e),
                (Some(a), None, None) => println!("{} {:?} {}", now, event.kind(), a),
                (None, _, Some(e)) => println!("{} {:?}: {}", now, event.kind(), e),
                (None, _, None) => println!("{} {:?}", now, event.kind()),
            }
        }
    });

    central.initialize()?;

    central.start_scan(ScanStrategy::new(), Duration::from_secs(1))?;
    thread::sleep(Duration::from_millis(200));
    transport.advertise(DiscoveredDevice::new(address.clone(), -48)
        .local_name("simulated")
        .connectable(true));
    central.stop_scan();

    central.execute(Command::connect(address.clone()))?;
    for service in central.services(&address).unwrap_or_default() {
        info!("service {} with {} characteristics", service.id(), service.characteristics().len());
    }

    match central.execute(Command::set_transfer_unit(address.clone(), mtu)) {
        Ok(r) => info!("{:?}", r),
        Err(e) => warn!("couldn't negotiate transfer unit: {}", e),
    }

    let write = WriteCharacteristic::new(address.clone(), DEFAULT_CHARACTERISTIC, payload)
        .description("demo write")
        .response(|reply| reply.len() >= 2);
    if let Response::Read(reply) = central.execute(write.into())? {
        println!("peer replied {}", String::from_utf8_lossy(&reply));
    }

    let read = ReadCharacteristic::new(address.clone(), DEFAULT_CHARACTERISTIC)
        .whole_frame(move |frame| frame.len() >= total)
        .timeout(Duration::from_secs(2));
    if let Response::Read(frame) = central.execute(read.into())? {
        println!("read {} bytes: {}", frame.len(), String::from_utf8_lossy(&frame));
    }

    central.execute(Command::disconnect(address))?;
    central.close();
    drop(central);
    printer.join().map_err(|_| anyhow!("event printer panicked"))?;
    Ok(())
}
