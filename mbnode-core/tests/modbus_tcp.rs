//! Modbus TCP slave exercised with a real Modbus client

use mbnode_core::app::LOOP_PERIOD;
use mbnode_core::modbus::service::RegisterService;
use mbnode_core::modbus::{
    modbus_slave_init, CommInfo, IpAddrType, ModbusSlave, Netif, RegisterArea, SlaveHandle, MAX_CONNECTIONS,
};
use mbnode_core::{increment_registers, ModbusSettings, RegisterBank, RegisterKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_modbus::prelude::*;
use tokio_modbus::ExceptionCode;

fn start_slave(bank: &Arc<RegisterBank>) -> (SlaveHandle, SocketAddr) {
    let settings = ModbusSettings {
        port: 0,
        ..ModbusSettings::default()
    };
    let handle = modbus_slave_init(bank, &settings, Netif::Ethernet).unwrap();
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), handle.port());
    (handle, addr)
}

fn start_slave_with_idle_timeout(bank: &Arc<RegisterBank>, idle_timeout: Duration) -> (SlaveHandle, SocketAddr) {
    let mut slave = ModbusSlave::tcp();
    slave
        .set_descriptor(RegisterArea::new(RegisterKind::Holding, 0, 100, bank.clone()))
        .unwrap();
    slave
        .setup(CommInfo {
            port: 0,
            addr_type: IpAddrType::V4,
            bind_addr: None,
            netif: Netif::Ethernet,
            idle_timeout,
        })
        .unwrap();
    let handle = slave.start().unwrap();
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), handle.port());
    (handle, addr)
}

async fn wait_for_connections(slave: &SlaveHandle, count: usize, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if slave.active_connections() == count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    slave.active_connections() == count
}

#[tokio::test]
async fn holding_register_counts_up_between_reads() -> Result<(), Box<dyn std::error::Error>> {
    let bank = Arc::new(RegisterBank::new());
    let (slave, addr) = start_slave(&bank);

    let mut ctx = tcp::connect(addr).await?;
    let first = ctx.read_holding_registers(0, 1).await??;
    increment_registers(&bank);
    let second = ctx.read_holding_registers(0, 1).await??;
    assert_eq!(second[0], first[0].wrapping_add(1));

    let input = ctx.read_input_registers(0, 50).await??;
    assert_eq!(input.len(), 50);
    assert!(input.iter().all(|&v| v == 5));

    ctx.disconnect().await?;
    slave.stop();
    Ok(())
}

#[tokio::test]
async fn register_loop_visible_over_tcp() -> Result<(), Box<dyn std::error::Error>> {
    let bank = Arc::new(RegisterBank::new());
    let (slave, addr) = start_slave(&bank);
    {
        let bank = bank.clone();
        let _ticker: std::thread::JoinHandle<()> =
            std::thread::spawn(move || mbnode_core::run_register_loop(&bank, Duration::from_millis(20)));
    }

    let mut ctx = tcp::connect(addr).await?;
    let first = ctx.read_holding_registers(0, 1).await??[0];
    tokio::time::sleep(Duration::from_millis(200)).await;
    let second = ctx.read_holding_registers(0, 1).await??[0];
    assert!(second.wrapping_sub(first) >= 1);

    let input = ctx.read_input_registers(49, 1).await??[0];
    assert_eq!(input % 5, 0);

    ctx.disconnect().await?;
    slave.stop();
    Ok(())
}

#[tokio::test]
async fn writes_land_in_the_bank() -> Result<(), Box<dyn std::error::Error>> {
    let bank = Arc::new(RegisterBank::new());
    let (slave, addr) = start_slave(&bank);

    let mut ctx = tcp::connect(addr).await?;
    ctx.write_single_register(7, 0xbeef).await??;
    ctx.write_multiple_registers(10, &[1, 2, 3]).await??;
    assert_eq!(bank.get(RegisterKind::Holding, 7), Some(0xbeef));
    assert_eq!(bank.snapshot(RegisterKind::Holding)[10..13], [1, 2, 3]);

    let back = ctx.read_holding_registers(10, 3).await??;
    assert_eq!(back, vec![1, 2, 3]);

    ctx.disconnect().await?;
    slave.stop();
    Ok(())
}

#[tokio::test]
async fn out_of_range_reads_get_exceptions() -> Result<(), Box<dyn std::error::Error>> {
    let bank = Arc::new(RegisterBank::new());
    let (slave, addr) = start_slave(&bank);

    let mut ctx = tcp::connect(addr).await?;
    let response = ctx.read_holding_registers(49, 2).await?;
    assert_eq!(response, Err(ExceptionCode::IllegalDataAddress));
    let response = ctx.read_input_registers(50, 1).await?;
    assert_eq!(response, Err(ExceptionCode::IllegalDataAddress));

    // Connection stays usable after an exception
    let ok = ctx.read_holding_registers(0, 50).await??;
    assert_eq!(ok.len(), 50);

    ctx.disconnect().await?;
    slave.stop();
    Ok(())
}

#[tokio::test]
async fn several_clients_share_the_bank() -> Result<(), Box<dyn std::error::Error>> {
    let bank = Arc::new(RegisterBank::new());
    let (slave, addr) = start_slave(&bank);

    let mut writer = tcp::connect(addr).await?;
    let mut reader = tcp::connect(addr).await?;
    writer.write_single_register(0, 42).await??;
    assert_eq!(reader.read_holding_registers(0, 1).await??, vec![42]);

    writer.disconnect().await?;
    reader.disconnect().await?;
    slave.stop();
    Ok(())
}

#[tokio::test]
async fn peer_filter_rejects_other_clients() -> Result<(), Box<dyn std::error::Error>> {
    let bank = Arc::new(RegisterBank::new());
    let mut slave = ModbusSlave::tcp();
    slave.set_descriptor(RegisterArea::new(RegisterKind::Holding, 0, 100, bank.clone()))?;
    slave.setup(CommInfo {
        port: 0,
        addr_type: IpAddrType::V4,
        bind_addr: Some(IpAddr::V4(Ipv4Addr::new(10, 9, 8, 7))),
        netif: Netif::WifiStation,
        idle_timeout: Duration::from_secs(20),
    })?;
    let handle = slave.start()?;
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), handle.port());

    // The socket is accepted and dropped, so the request fails.
    let mut ctx = tcp::connect(addr).await?;
    let result = tokio::time::timeout(Duration::from_secs(2), ctx.read_holding_registers(0, 1)).await;
    assert!(!matches!(result, Ok(Ok(Ok(_)))));

    handle.stop();
    Ok(())
}

#[tokio::test]
async fn holding_register_steps_once_per_period() -> Result<(), Box<dyn std::error::Error>> {
    let bank = Arc::new(RegisterBank::new());
    let (slave, addr) = start_slave(&bank);
    {
        let bank = bank.clone();
        let _ticker: std::thread::JoinHandle<()> =
            std::thread::spawn(move || mbnode_core::run_register_loop(&bank, LOOP_PERIOD));
    }

    let mut ctx = tcp::connect(addr).await?;

    // Line up with a tick, then read again 1100 ms later.
    let seen = ctx.read_holding_registers(0, 1).await??[0];
    let deadline = Instant::now() + Duration::from_secs(3);
    let first = loop {
        let value = ctx.read_holding_registers(0, 1).await??[0];
        if value != seen || Instant::now() > deadline {
            break value;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let second = ctx.read_holding_registers(0, 1).await??[0];
    assert_eq!(second, first.wrapping_add(1));

    ctx.disconnect().await?;
    slave.stop();
    Ok(())
}

#[tokio::test]
async fn silent_clients_are_dropped() -> Result<(), Box<dyn std::error::Error>> {
    let bank = Arc::new(RegisterBank::new());
    let (slave, addr) = start_slave_with_idle_timeout(&bank, Duration::from_millis(500));

    let idle: Vec<TcpStream> = (0..MAX_CONNECTIONS).map(|_| TcpStream::connect(addr)).collect::<Result<_, _>>()?;
    assert!(wait_for_connections(&slave, MAX_CONNECTIONS, Duration::from_secs(2)).await);
    assert!(wait_for_connections(&slave, 0, Duration::from_secs(3)).await);

    let mut ctx = tcp::connect(addr).await?;
    assert_eq!(ctx.read_holding_registers(0, 1).await??, vec![0]);

    ctx.disconnect().await?;
    drop(idle);
    slave.stop();
    Ok(())
}

#[tokio::test]
async fn connections_beyond_the_limit_are_refused() -> Result<(), Box<dyn std::error::Error>> {
    let bank = Arc::new(RegisterBank::new());
    let (slave, addr) = start_slave_with_idle_timeout(&bank, Duration::from_secs(20));

    let held: Vec<TcpStream> = (0..MAX_CONNECTIONS).map(|_| TcpStream::connect(addr)).collect::<Result<_, _>>()?;
    assert!(wait_for_connections(&slave, MAX_CONNECTIONS, Duration::from_secs(2)).await);

    let mut extra = tcp::connect(addr).await?;
    let result = tokio::time::timeout(Duration::from_secs(2), extra.read_holding_registers(0, 1)).await;
    assert!(!matches!(result, Ok(Ok(Ok(_)))));
    assert_eq!(slave.active_connections(), MAX_CONNECTIONS);

    drop(held);
    assert!(wait_for_connections(&slave, 0, Duration::from_secs(2)).await);
    slave.stop();
    Ok(())
}

// Reads racing the increment loop only ever see whole increments.
#[test]
fn interleaved_reads_never_tear() {
    let bank = Arc::new(RegisterBank::new());
    let service = RegisterService::new(Arc::from(vec![
        RegisterArea::new(RegisterKind::Holding, 0, 100, bank.clone()),
        RegisterArea::new(RegisterKind::Input, 0, 100, bank.clone()),
    ]));

    let ticker = {
        let bank = bank.clone();
        std::thread::spawn(move || {
            for _ in 0..1000 {
                increment_registers(&bank);
                std::thread::yield_now();
            }
        })
    };

    let mut last = 0u16;
    for _ in 0..1000 {
        let Ok(Response::ReadHoldingRegisters(holding)) = service.handle(Request::ReadHoldingRegisters(0, 50)) else {
            panic!("holding read failed");
        };
        assert!(holding.iter().all(|&v| v == holding[0]));
        assert!(holding[0] >= last);
        last = holding[0];

        let Ok(Response::ReadInputRegisters(input)) = service.handle(Request::ReadInputRegisters(0, 50)) else {
            panic!("input read failed");
        };
        assert_eq!(input.len(), 50);
        assert!(input.iter().all(|&v| v == input[0]));
        assert_eq!(input[0] % 5, 0);
        assert!(input[0] >= last * 5);
    }

    ticker.join().unwrap();
    assert_eq!(bank.get(RegisterKind::Holding, 0), Some(1000));
    assert_eq!(bank.get(RegisterKind::Input, 0), Some(5000));
}
