use serde::{Deserialize, Serialize};

pub type InterfaceId = u32;

/// The endpoint implicitly created together with the pipe.
pub const MASTER_INTERFACE_ID: InterfaceId = 0;
pub const INVALID_INTERFACE_ID: InterfaceId = u32::MAX;
/// Set on every id allocated by the [`InterfaceIdNamespace::Client`] side of a pipe.
pub const INTERFACE_ID_NAMESPACE_MASK: InterfaceId = 0x8000_0000;

pub fn is_valid_interface_id(id: InterfaceId) -> bool {
    id != INVALID_INTERFACE_ID
}

pub fn is_master_interface_id(id: InterfaceId) -> bool {
    id == MASTER_INTERFACE_ID
}

pub fn has_namespace_bit(id: InterfaceId) -> bool {
    id & INTERFACE_ID_NAMESPACE_MASK != 0
}

/// Which half of the id space a router allocates from.
///
/// The two ends of a pipe must be constructed with opposite namespaces so that ids allocated
/// independently on each side never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceIdNamespace {
    /// The side that initiated the pipe (the interface pointer). Sets the namespace bit.
    Client,
    /// The side that accepted the pipe (the binding).
    Service,
}

impl InterfaceIdNamespace {
    pub fn sets_namespace_bit(self) -> bool {
        matches!(self, InterfaceIdNamespace::Client)
    }

    pub fn peer(self) -> Self {
        match self {
            InterfaceIdNamespace::Client => InterfaceIdNamespace::Service,
            InterfaceIdNamespace::Service => InterfaceIdNamespace::Client,
        }
    }

    /// Whether `id` was (or could have been) allocated in this namespace.
    pub fn owns(self, id: InterfaceId) -> bool {
        !is_master_interface_id(id)
            && is_valid_interface_id(id)
            && has_namespace_bit(id) == self.sets_namespace_bit()
    }
}

/// Allocates associated interface ids for one end of a pipe.
#[derive(Debug)]
pub struct InterfaceIdAllocator {
    namespace: InterfaceIdNamespace,
    next: u32,
}

impl InterfaceIdAllocator {
    pub fn new(namespace: InterfaceIdNamespace) -> Self {
        Self { namespace, next: 1 }
    }

    pub fn namespace(&self) -> InterfaceIdNamespace {
        self.namespace
    }

    /// Returns the next id in this namespace for which `in_use` is false.
    ///
    /// Returns `None` once the whole namespace is exhausted.
    pub fn allocate(&mut self, in_use: impl Fn(InterfaceId) -> bool) -> Option<InterfaceId> {
        let span = INTERFACE_ID_NAMESPACE_MASK;
        for _ in 0..span {
            let raw = self.next & !INTERFACE_ID_NAMESPACE_MASK;
            self.next = (self.next + 1) & !INTERFACE_ID_NAMESPACE_MASK;
            if raw == 0 {
                continue;
            }
            let id = if self.namespace.sets_namespace_bit() {
                raw | INTERFACE_ID_NAMESPACE_MASK
            } else {
                raw
            };
            if !is_valid_interface_id(id) || in_use(id) {
                continue;
            }
            return Some(id);
        }
        None
    }

    /// Whether the peer may ask this side to adopt `id`.
    ///
    /// The master id is shared; every other id must come from the peer's namespace.
    pub fn is_acceptable_remote_id(&self, id: InterfaceId) -> bool {
        is_master_interface_id(id) || self.namespace.peer().owns(id)
    }
}
