//! The RDM parameter store.
//!
//! Each port owns an append-only table of parameter records and a
//! bump-allocated slab holding their packed data. Records never move and the
//! slab is never reclaimed, so aliases may safely reference a range inside
//! another parameter's storage.

use crate::consts::{RDM_PD_SLAB_SIZE, RDM_QUEUE_SIZE_MAX, RDM_RESPONDER_PIDS_MAX};
use crate::fmt;
use crate::rdm_data::RdmHeader;
use crate::types::{DataPack, NackReason, RequestCommandClass};
use crate::unique_identifier::UniqueIdentifier;

/// Opaque user data passed back to response handlers and callbacks.
pub type Context = &'static (dyn core::any::Any + Send + Sync);

/// Outcome of a response handler.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Response {
    /// Send no response at all.
    None,
    /// Acknowledge; the handler filled the outgoing parameter data.
    Ack,
    /// Acknowledge, the result will be ready after the given time in 100 ms
    /// steps.
    AckTimer(u16),
    /// Acknowledge; the handler filled one part of an overflowing response.
    AckOverflow,
    /// Refuse the request for the given reason.
    Nack(NackReason),
    /// The handler could not make sense of the request. The dispatcher turns
    /// this into a hardware-fault NACK.
    Invalid,
}

/// Everything a response handler may touch.
///
/// Handlers run on the caller task inside `receive` while the driver mutex is
/// held. They must not re-enter the driver; response emission is the
/// dispatcher's job. Everything a handler needs arrives through this context
/// and the parameter data buffer it is handed.
pub struct HandlerContext<'a> {
    pub port: usize,
    /// This responder's unique id.
    pub uid: UniqueIdentifier,
    /// True while the responder ignores DISC_UNIQUE_BRANCH requests.
    pub discovery_muted: &'a mut bool,
    /// Number of queued messages awaiting collection.
    pub message_count: u8,
    /// The handled parameter's slab storage, if it has any.
    pub param: Option<&'a mut [u8]>,
    pub definition: &'a ParameterDefinition,
    /// All PIDs registered on this port.
    pub registered_pids: heapless::Vec<u16, RDM_RESPONDER_PIDS_MAX>,
    pub context: Option<Context>,
}

/// Handles one request for a registered PID. `pd` holds the request
/// parameter data on entry and must hold the response parameter data when
/// the handler returns an acknowledging response.
pub type ResponseHandler =
    fn(ctx: &mut HandlerContext<'_>, header: &RdmHeader, pd: &mut DataPack) -> Response;

/// Notifies the application after a request was dispatched for its PID.
pub type ParameterCallback = fn(port: usize, header: &RdmHeader, context: Option<Context>);

/// RDM data types, ANSI E1.20 table A-15 (abridged to what the driver uses).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DataType {
    NotDefined = 0x00,
    BitField = 0x01,
    Ascii = 0x03,
    UnsignedByte = 0x05,
    UnsignedWord = 0x07,
    UnsignedDword = 0x09,
}

/// Request command classes a PID responds to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PidCc {
    Disc,
    Get,
    Set,
    GetSet,
}

impl PidCc {
    pub fn supports(&self, cc: RequestCommandClass) -> bool {
        match cc {
            RequestCommandClass::DiscoveryCommand => matches!(self, PidCc::Disc),
            RequestCommandClass::GetCommand => matches!(self, PidCc::Get | PidCc::GetSet),
            RequestCommandClass::SetCommand => matches!(self, PidCc::Set | PidCc::GetSet),
        }
    }
}

/// Descriptor of a registered parameter, ANSI E1.20 §10.
#[derive(Copy, Clone)]
pub struct ParameterDefinition {
    pub pid: u16,
    pub cc: PidCc,
    pub data_type: DataType,
    /// Packed size of the stored value, bytes.
    pub pdl_size: u16,
    /// Packing descriptor, see [`crate::format`].
    pub format: &'static str,
    /// Persist value changes through the platform's storage hooks.
    pub nvs: bool,
    pub response_handler: ResponseHandler,
}

#[derive(Copy, Clone)]
enum Storage {
    /// The handler computes the value on demand.
    None,
    /// A range of the parameter data slab.
    Slab { offset: usize, len: usize },
}

pub(crate) struct Parameter {
    pub definition: ParameterDefinition,
    storage: Storage,
    pub callback: Option<ParameterCallback>,
    pub context: Option<Context>,
}

pub(crate) struct ParameterTable {
    pub uid: UniqueIdentifier,
    pub discovery_muted: bool,
    pub software_version_label: &'static str,
    entries: heapless::Vec<Parameter, RDM_RESPONDER_PIDS_MAX>,
    pd: [u8; RDM_PD_SLAB_SIZE],
    pd_head: usize,
    queue: heapless::Vec<u16, RDM_QUEUE_SIZE_MAX>,
}

impl ParameterTable {
    pub fn new() -> Self {
        Self {
            uid: UniqueIdentifier::new(0x7FF0, 0).unwrap(), // prototyping id
            discovery_muted: false,
            software_version_label: "",
            entries: heapless::Vec::new(),
            pd: [0; RDM_PD_SLAB_SIZE],
            pd_head: 0,
            queue: heapless::Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.queue.clear();
        self.pd_head = 0;
        self.discovery_muted = false;
    }

    fn find_index(&self, pid: u16) -> Option<usize> {
        // Linear search: with a couple dozen entries this beats hashing.
        self.entries.iter().position(|p| p.definition.pid == pid)
    }

    pub fn find(&self, pid: u16) -> Option<&Parameter> {
        self.find_index(pid).map(|index| &self.entries[index])
    }

    fn push(&mut self, definition: ParameterDefinition, storage: Storage) -> bool {
        if self
            .entries
            .push(Parameter {
                definition,
                storage,
                callback: None,
                context: None,
            })
            .is_err()
        {
            fmt::warn!("parameter table is full, PID 0x{:04x} dropped", definition.pid);
            return false;
        }

        true
    }

    /// Registers a stored parameter, allocating `pdl_size` bytes from the
    /// slab and initializing them with `default`. Registering an existing
    /// PID is a no-op that leaves the slab untouched.
    pub fn add_new(&mut self, definition: ParameterDefinition, default: Option<&[u8]>) -> bool {
        if self.find_index(definition.pid).is_some() {
            return false;
        }

        let len = definition.pdl_size as usize;
        if self.pd_head + len > RDM_PD_SLAB_SIZE {
            fmt::warn!("parameter slab exhausted, PID 0x{:04x} dropped", definition.pid);
            return false;
        }

        let offset = self.pd_head;
        self.pd[offset..offset + len].fill(0);
        if let Some(default) = default {
            let count = default.len().min(len);
            // ASCII values keep at least one trailing NUL.
            let count = if definition.data_type == DataType::Ascii {
                count.min(len.saturating_sub(1))
            } else {
                count
            };
            self.pd[offset..offset + count].copy_from_slice(&default[..count]);
        }

        if !self.push(definition, Storage::Slab { offset, len }) {
            return false;
        }
        self.pd_head += len;

        true
    }

    /// Registers a parameter that shares storage with `alias_pid`, starting
    /// `offset` bytes into its slab range.
    pub fn add_alias(
        &mut self,
        definition: ParameterDefinition,
        alias_pid: u16,
        offset: usize,
    ) -> bool {
        if self.find_index(definition.pid).is_some() {
            return false;
        }

        let Some(alias) = self.find(alias_pid) else {
            fmt::warn!("alias target PID 0x{:04x} is not registered", alias_pid);
            return false;
        };
        let Storage::Slab {
            offset: base,
            len: base_len,
        } = alias.storage
        else {
            return false;
        };

        let len = definition.pdl_size as usize;
        if offset + len > base_len {
            fmt::warn!("alias range exceeds PID 0x{:04x} storage", alias_pid);
            return false;
        }

        self.push(
            definition,
            Storage::Slab {
                offset: base + offset,
                len,
            },
        )
    }

    /// Registers a parameter without storage; its handler computes the value.
    pub fn add_deterministic(&mut self, definition: ParameterDefinition) -> bool {
        if self.find_index(definition.pid).is_some() {
            return false;
        }

        self.push(definition, Storage::None)
    }

    pub fn update_response_handler(&mut self, pid: u16, handler: ResponseHandler) -> bool {
        match self.find_index(pid) {
            Some(index) => {
                self.entries[index].definition.response_handler = handler;
                true
            },
            None => false,
        }
    }

    pub fn update_callback(
        &mut self,
        pid: u16,
        callback: ParameterCallback,
        context: Option<Context>,
    ) -> bool {
        match self.find_index(pid) {
            Some(index) => {
                self.entries[index].callback = Some(callback);
                self.entries[index].context = context;
                true
            },
            None => false,
        }
    }

    fn storage_range(&self, pid: u16) -> Option<(usize, usize)> {
        match self.find(pid)?.storage {
            Storage::Slab { offset, len } => Some((offset, len)),
            Storage::None => None,
        }
    }

    /// Copies the stored value of `pid` into `dst`. Returns the number of
    /// bytes copied, 0 when the parameter is absent or deterministic.
    pub fn read(&self, pid: u16, dst: &mut [u8]) -> usize {
        let Some((offset, len)) = self.storage_range(pid) else {
            return 0;
        };

        let count = len.min(dst.len());
        dst[..count].copy_from_slice(&self.pd[offset..offset + count]);

        count
    }

    /// Overwrites the stored value of `pid`. Deterministic parameters are
    /// left unchanged.
    pub fn set(&mut self, pid: u16, data: &[u8]) -> bool {
        let Some((offset, len)) = self.storage_range(pid) else {
            return false;
        };

        let count = data.len().min(len);
        self.pd[offset..offset + count].copy_from_slice(&data[..count]);
        if self.find(pid).map(|p| p.definition.data_type) == Some(DataType::Ascii) {
            self.pd[offset + count..offset + len].fill(0);
        }

        true
    }

    pub fn slab_slice(&mut self, pid: u16) -> Option<&mut [u8]> {
        let (offset, len) = self.storage_range(pid)?;
        Some(&mut self.pd[offset..offset + len])
    }

    /// Queues `pid` for collection by the controller. Idempotent: queuing an
    /// already-pending PID returns its existing index. `None` when full.
    pub fn enqueue(&mut self, pid: u16) -> Option<usize> {
        if let Some(index) = self.queue.iter().position(|&queued| queued == pid) {
            return Some(index);
        }

        self.queue.push(pid).ok()?;
        Some(self.queue.len() - 1)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Copies up to `out.len()` pending PIDs into `out`.
    pub fn queue_list(&self, out: &mut [u16]) -> usize {
        let count = self.queue.len().min(out.len());
        out[..count].copy_from_slice(&self.queue[..count]);

        count
    }

    pub fn registered_pids(&self) -> heapless::Vec<u16, RDM_RESPONDER_PIDS_MAX> {
        self.entries
            .iter()
            .map(|p| p.definition.pid)
            .collect()
    }

    pub fn callback_of(&self, pid: u16) -> Option<(ParameterCallback, Option<Context>)> {
        let parameter = self.find(pid)?;
        parameter
            .callback
            .map(|callback| (callback, parameter.context))
    }

    /// Invokes the response handler of `header.pid` with a context over this
    /// table. `None` when the PID is not registered.
    pub fn run_handler(
        &mut self,
        port: usize,
        header: &RdmHeader,
        pd: &mut DataPack,
    ) -> Option<Response> {
        let index = self.find_index(header.pid)?;
        let definition = self.entries[index].definition;
        let context = self.entries[index].context;
        let registered_pids = self.registered_pids();
        let message_count = self.queue.len().min(u8::MAX as usize) as u8;
        let uid = self.uid;

        let param = match self.entries[index].storage {
            Storage::Slab { offset, len } => Some(&mut self.pd[offset..offset + len]),
            Storage::None => None,
        };

        let mut ctx = HandlerContext {
            port,
            uid,
            discovery_muted: &mut self.discovery_muted,
            message_count,
            param,
            definition: &definition,
            registered_pids,
            context,
        };

        Some((definition.response_handler)(&mut ctx, header, pd))
    }
}

impl<P, U, T, const PORTS: usize> crate::driver::DmxDriver<P, U, T, PORTS>
where
    P: crate::hal::Platform,
    U: crate::hal::Uart,
    T: crate::hal::BusTimer,
{
    /// Registers a stored parameter backed by freshly allocated slab bytes,
    /// initialized from `default` (zero-filled when `None`). Registering an
    /// already-known PID is a no-op that returns false.
    pub fn rdm_parameter_add_new(
        &self,
        port: usize,
        definition: ParameterDefinition,
        default: Option<&[u8]>,
    ) -> bool {
        if !self.check_installed(port) || definition.pid == 0 {
            return false;
        }
        if !crate::format::is_valid(definition.format) {
            crate::fmt::warn!("PID 0x{:04x} has an invalid format", definition.pid);
            return false;
        }

        critical_section::with(|cs| {
            self.port(port)
                .table
                .borrow_ref_mut(cs)
                .add_new(definition, default)
        })
    }

    /// Registers a parameter sharing storage with `alias_pid`, starting at
    /// `offset` bytes into its allocation.
    pub fn rdm_parameter_add_alias(
        &self,
        port: usize,
        definition: ParameterDefinition,
        alias_pid: u16,
        offset: usize,
    ) -> bool {
        if !self.check_installed(port) || definition.pid == 0 {
            return false;
        }
        if !crate::format::is_valid(definition.format) {
            crate::fmt::warn!("PID 0x{:04x} has an invalid format", definition.pid);
            return false;
        }

        critical_section::with(|cs| {
            self.port(port)
                .table
                .borrow_ref_mut(cs)
                .add_alias(definition, alias_pid, offset)
        })
    }

    /// Registers a parameter whose value is computed by its handler.
    pub fn rdm_parameter_add_deterministic(
        &self,
        port: usize,
        definition: ParameterDefinition,
    ) -> bool {
        if !self.check_installed(port) || definition.pid == 0 {
            return false;
        }

        critical_section::with(|cs| {
            self.port(port)
                .table
                .borrow_ref_mut(cs)
                .add_deterministic(definition)
        })
    }

    /// Replaces the response handler of a registered PID.
    pub fn rdm_update_response_handler(
        &self,
        port: usize,
        pid: u16,
        handler: ResponseHandler,
    ) -> bool {
        if !self.check_installed(port) {
            return false;
        }

        critical_section::with(|cs| {
            self.port(port)
                .table
                .borrow_ref_mut(cs)
                .update_response_handler(pid, handler)
        })
    }

    /// Installs or replaces the application callback of a registered PID.
    pub fn rdm_update_callback(
        &self,
        port: usize,
        pid: u16,
        callback: ParameterCallback,
        context: Option<Context>,
    ) -> bool {
        if !self.check_installed(port) {
            return false;
        }

        critical_section::with(|cs| {
            self.port(port)
                .table
                .borrow_ref_mut(cs)
                .update_callback(pid, callback, context)
        })
    }

    /// Copies the stored value of `pid` into `destination`. Returns bytes
    /// copied; 0 when the parameter is absent or deterministic.
    pub fn rdm_parameter_read(&self, port: usize, pid: u16, destination: &mut [u8]) -> usize {
        if !self.check_installed(port) {
            return 0;
        }

        critical_section::with(|cs| self.port(port).table.borrow_ref(cs).read(pid, destination))
    }

    /// Overwrites the stored value of `pid`. Fails silently on deterministic
    /// parameters.
    pub fn rdm_parameter_set(&self, port: usize, pid: u16, data: &[u8]) -> bool {
        if !self.check_installed(port) {
            return false;
        }

        critical_section::with(|cs| self.port(port).table.borrow_ref_mut(cs).set(pid, data))
    }

    /// Queues a PID for collection by the controller. Returns its queue
    /// index; queuing a pending PID returns the existing index, `None` means
    /// the queue is full.
    pub fn rdm_queue_push(&self, port: usize, pid: u16) -> Option<usize> {
        if !self.check_installed(port) {
            return None;
        }

        critical_section::with(|cs| self.port(port).table.borrow_ref_mut(cs).enqueue(pid))
    }

    /// Number of messages pending in the RDM queue. Reported as
    /// `message_count` in outgoing responses.
    pub fn rdm_queue_size(&self, port: usize) -> usize {
        if !self.check_installed(port) {
            return 0;
        }

        critical_section::with(|cs| self.port(port).table.borrow_ref(cs).queue_len())
    }

    /// Copies up to `out.len()` pending PIDs into `out`, returning the count.
    pub fn rdm_queue_list(&self, port: usize, out: &mut [u16]) -> usize {
        if !self.check_installed(port) {
            return 0;
        }

        critical_section::with(|cs| self.port(port).table.borrow_ref(cs).queue_list(out))
    }

    /// This responder's unique id.
    pub fn rdm_uid(&self, port: usize) -> Option<UniqueIdentifier> {
        if !self.check_installed(port) {
            return None;
        }

        Some(critical_section::with(|cs| {
            self.port(port).table.borrow_ref(cs).uid
        }))
    }

    /// True while the responder ignores DISC_UNIQUE_BRANCH requests.
    pub fn rdm_discovery_is_muted(&self, port: usize) -> bool {
        self.check_installed(port)
            && critical_section::with(|cs| self.port(port).table.borrow_ref(cs).discovery_muted)
    }
}
