use crate::utils::Endpoint;

use std::{
    cell::RefCell,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Routing metadata shared by every leg of one tunnel.
#[derive(Debug)]
pub struct Session {
    id: u64,
    endpoint: RefCell<Option<Rc<Endpoint>>>,
}

impl Session {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            endpoint: RefCell::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> Option<Rc<Endpoint>> {
        self.endpoint.borrow().clone()
    }

    pub fn set_endpoint(&self, endpoint: Endpoint) {
        self.endpoint.replace(Some(Rc::new(endpoint)));
    }
}
