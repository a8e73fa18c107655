//! Register access for the tokio-modbus server
//!
//! One [`RegisterService`] is created per client connection. It resolves
//! each request against the registered areas and reads or writes the bank
//! under the bank's own lock.

use super::RegisterArea;
use crate::registers::RegisterKind;
use log::*;
use std::future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_modbus::prelude::*;

/// Largest register count of a read request
pub const MAX_READ_QUANTITY: u16 = 125;
/// Largest register count of a write multiple request
pub const MAX_WRITE_QUANTITY: u16 = 123;

pub struct RegisterService {
    areas: Arc<[RegisterArea]>,
    connection: Option<(SocketAddr, Arc<AtomicUsize>)>,
}

impl RegisterService {
    pub fn new(areas: Arc<[RegisterArea]>) -> Self {
        Self {
            areas,
            connection: None,
        }
    }

    /// Service for the client at `peer`, counted in `active` until dropped
    pub(crate) fn for_client(areas: Arc<[RegisterArea]>, peer: SocketAddr, active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self {
            areas,
            connection: Some((peer, active)),
        }
    }

    /// Execute one request against the registered areas
    pub fn handle(&self, request: Request<'_>) -> Result<Response, ExceptionCode> {
        match request {
            Request::ReadHoldingRegisters(address, quantity) => self
                .read(RegisterKind::Holding, address, quantity)
                .map(Response::ReadHoldingRegisters),
            Request::ReadInputRegisters(address, quantity) => self
                .read(RegisterKind::Input, address, quantity)
                .map(Response::ReadInputRegisters),
            Request::WriteSingleRegister(address, value) => self
                .write(address, std::slice::from_ref(&value))
                .map(|()| Response::WriteSingleRegister(address, value)),
            Request::WriteMultipleRegisters(address, values) => {
                if values.is_empty() || values.len() > MAX_WRITE_QUANTITY as usize {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                self.write(address, &values)
                    .map(|()| Response::WriteMultipleRegisters(address, values.len() as u16))
            }
            other => {
                debug!(target: "mbnode::modbus", "Unsupported request {:?}", other);
                Err(ExceptionCode::IllegalFunction)
            }
        }
    }

    fn find(&self, kind: RegisterKind, address: u16, quantity: u16) -> Result<(&RegisterArea, usize), ExceptionCode> {
        self.areas
            .iter()
            .filter(|area| area.kind == kind)
            .find_map(|area| area.resolve(address, quantity).map(|index| (area, index)))
            .ok_or(ExceptionCode::IllegalDataAddress)
    }

    fn read(&self, kind: RegisterKind, address: u16, quantity: u16) -> Result<Vec<u16>, ExceptionCode> {
        if quantity == 0 || quantity > MAX_READ_QUANTITY {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let (area, index) = self.find(kind, address, quantity)?;
        let mut values = vec![0u16; quantity as usize];
        if !area.bank.read(kind, index, &mut values) {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(values)
    }

    fn write(&self, address: u16, values: &[u16]) -> Result<(), ExceptionCode> {
        let (area, index) = self.find(RegisterKind::Holding, address, values.len() as u16)?;
        if !area.bank.write(RegisterKind::Holding, index, values) {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(())
    }
}

impl tokio_modbus::server::Service for RegisterService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        future::ready(self.handle(req))
    }
}

impl Drop for RegisterService {
    fn drop(&mut self) {
        if let Some((peer, active)) = &self.connection {
            active.fetch_sub(1, Ordering::AcqRel);
            info!(target: "mbnode::modbus", "Client disconnected: {}", peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::RegisterBank;
    use std::borrow::Cow;

    fn service(bank: &Arc<RegisterBank>) -> RegisterService {
        RegisterService::new(Arc::from(vec![
            RegisterArea::new(RegisterKind::Holding, 0, 100, bank.clone()),
            RegisterArea::new(RegisterKind::Input, 0, 100, bank.clone()),
        ]))
    }

    #[test]
    fn reads_come_from_the_right_block() {
        let bank = Arc::new(RegisterBank::new());
        bank.increment(1, 5);
        let service = service(&bank);

        let holding = service.handle(Request::ReadHoldingRegisters(3, 2)).unwrap();
        assert_eq!(holding, Response::ReadHoldingRegisters(vec![1, 1]));
        let input = service.handle(Request::ReadInputRegisters(49, 1)).unwrap();
        assert_eq!(input, Response::ReadInputRegisters(vec![5]));
    }

    #[test]
    fn bad_quantities_and_addresses() {
        let bank = Arc::new(RegisterBank::new());
        let service = service(&bank);

        assert_eq!(
            service.handle(Request::ReadHoldingRegisters(0, 0)),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            service.handle(Request::ReadInputRegisters(0, 126)),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            service.handle(Request::ReadHoldingRegisters(49, 2)),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            service.handle(Request::WriteSingleRegister(50, 1)),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            service.handle(Request::WriteMultipleRegisters(0, Cow::Owned(Vec::new()))),
            Err(ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn writes_only_reach_holding_registers() {
        let bank = Arc::new(RegisterBank::new());
        let service = service(&bank);

        let response = service
            .handle(Request::WriteMultipleRegisters(10, Cow::Owned(vec![1, 2])))
            .unwrap();
        assert_eq!(response, Response::WriteMultipleRegisters(10, 2));
        assert_eq!(bank.snapshot(RegisterKind::Holding)[10..12], [1, 2]);
        assert!(bank.snapshot(RegisterKind::Input).iter().all(|&v| v == 0));

        assert_eq!(
            service.handle(Request::ReadCoils(0, 1)),
            Err(ExceptionCode::IllegalFunction)
        );
    }

    #[test]
    fn connection_count_follows_service_lifetime() {
        let bank = Arc::new(RegisterBank::new());
        let active = Arc::new(AtomicUsize::new(0));
        let areas: Arc<[RegisterArea]> = Arc::from(vec![RegisterArea::new(RegisterKind::Holding, 0, 100, bank)]);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        let first = RegisterService::for_client(areas.clone(), peer, active.clone());
        let second = RegisterService::for_client(areas, peer, active.clone());
        assert_eq!(active.load(Ordering::Acquire), 2);
        drop(first);
        drop(second);
        assert_eq!(active.load(Ordering::Acquire), 0);
    }
}
