use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;

use api_types::DeviceClass;

use super::DeviceApi;
use super::DeviceDescriptor;
use super::DeviceHandle;
use super::RawStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    Open,
    Query,
}

#[derive(Debug, Clone, Copy)]
enum Behavior {
    Respond(RawStatus),
    Fail(FailureMode),
}

/// In-memory device double keyed by namespace path.
///
/// Counts opens and closes so tests can check that every handle is released.
#[derive(Clone, Default)]
pub struct MockDeviceApi {
    devices: Rc<RefCell<HashMap<String, Behavior>>>,
    opened: Rc<Cell<usize>>,
    closed: Rc<Cell<usize>>,
}

impl MockDeviceApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, blk_name: &str, status: RawStatus) {
        self.devices
            .borrow_mut()
            .insert(blk_name.to_string(), Behavior::Respond(status));
    }

    pub fn set_load(&self, blk_name: &str, current_load: u32) {
        self.set_status(
            blk_name,
            RawStatus {
                current_load,
                total_contexts: 1,
                ..RawStatus::default()
            },
        );
    }

    pub fn set_failure(&self, blk_name: &str, mode: FailureMode) {
        self.devices
            .borrow_mut()
            .insert(blk_name.to_string(), Behavior::Fail(mode));
    }

    pub fn opened(&self) -> usize {
        self.opened.get()
    }

    pub fn closed(&self) -> usize {
        self.closed.get()
    }
}

pub struct MockHandle {
    behavior: Behavior,
    closed: Rc<Cell<usize>>,
}

impl DeviceHandle for MockHandle {
    fn query_status(&mut self, _class: DeviceClass, _hw_id: i32) -> io::Result<RawStatus> {
        match self.behavior {
            Behavior::Respond(status) => Ok(status),
            Behavior::Fail(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "no response")),
        }
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.closed.set(self.closed.get() + 1);
    }
}

impl DeviceApi for MockDeviceApi {
    type Handle = MockHandle;

    fn open(&self, descriptor: &DeviceDescriptor) -> io::Result<Self::Handle> {
        let behavior = match self.devices.borrow().get(&descriptor.blk_name) {
            Some(Behavior::Fail(FailureMode::Open)) => {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "open refused"))
            }
            Some(behavior) => *behavior,
            None => return Err(io::Error::from(io::ErrorKind::NotFound)),
        };

        self.opened.set(self.opened.get() + 1);
        Ok(MockHandle {
            behavior,
            closed: Rc::clone(&self.closed),
        })
    }
}
