//! The RDM dispatcher and the built-in responder parameters.
//!
//! `receive` forwards every checksum-valid RDM request addressed to this
//! device here. The dispatcher validates the request, runs the registered
//! response handler, applies the broadcast and discovery response policies,
//! rewrites the header and emits the reply through `send`. Handlers never
//! send anything themselves.

use modular_bitfield::bitfield;
use modular_bitfield::prelude::B12;

use crate::consts::{
    DMX_PACKET_TIMEOUT_US, RDM_HEADER_SIZE, RDM_MAX_MESSAGE_SIZE, RDM_MAX_PDL, SUB_DEVICE_ALL,
    SUB_DEVICE_ROOT,
};
use crate::driver::{DmxConfig, DmxDriver};
use crate::fmt;
use crate::format;
use crate::hal::{BusTimer, Platform, Uart};
use crate::layouts::rdm_device_info_layout;
use crate::parameter::{
    Context, DataType, HandlerContext, ParameterDefinition, PidCc, Response,
};
use crate::pids;
use crate::rdm_data::{self, RdmHeader};
use crate::types::{DataPack, NackReason, RequestCommandClass, ResponseType};
use crate::unique_identifier::PackageAddress;

/// Control field of DISC_MUTE / DISC_UN_MUTE responses, E1.20 §7.6.
#[bitfield]
struct MuteControlField {
    managed_proxy: bool,
    sub_device: bool,
    boot_loader: bool,
    proxy_device: bool,
    #[skip]
    reserved: B12,
}

impl<P: Platform, U: Uart, T: BusTimer, const PORTS: usize> DmxDriver<P, U, T, PORTS> {
    /// Handles the RDM message sitting in the driver buffer. Returns true
    /// when the buffer held a checksum-valid RDM message of any kind.
    pub(crate) fn rdm_dispatch(&self, port: usize, size: usize) -> bool {
        let p = self.port(port);

        // Snapshot the message; later bus traffic may overwrite the buffer.
        let mut message = [0u8; RDM_MAX_MESSAGE_SIZE];
        let count = size.min(RDM_MAX_MESSAGE_SIZE);
        self.read_offset(port, 0, &mut message[..count]);

        let Some((mut header, _total)) = rdm_data::read_header(&message[..count]) else {
            return false;
        };

        let Some(request_class) = header.request_class() else {
            // Responses are surfaced to the caller, not dispatched.
            return true;
        };

        let uid = critical_section::with(|cs| p.table.borrow_ref(cs).uid);
        if !header.dest_uid.is_target(&uid) {
            return true;
        }

        let request_header = header.clone();
        let mut pd =
            DataPack::from_slice(&message[RDM_HEADER_SIZE..RDM_HEADER_SIZE + header.pdl as usize])
                .unwrap();

        let definition = critical_section::with(|cs| {
            p.table
                .borrow_ref(cs)
                .find(header.pid)
                .map(|parameter| parameter.definition)
        });

        let response = if header.port_id == 0 || header.src_uid.is_broadcast() {
            Response::Nack(NackReason::FormatError)
        } else if (header.sub_device != SUB_DEVICE_ROOT && header.sub_device != SUB_DEVICE_ALL)
            || (header.sub_device == SUB_DEVICE_ALL
                && request_class == RequestCommandClass::GetCommand)
        {
            // Sub-devices are unsupported; only root and all-sub-devices
            // addressing is answered.
            Response::Nack(NackReason::SubDeviceOutOfRange)
        } else {
            match &definition {
                None => Response::Nack(NackReason::UnknownPid),
                Some(def) if !def.cc.supports(request_class) => {
                    Response::Nack(NackReason::UnsupportedCommandClass)
                },
                Some(_) => {
                    let handled = critical_section::with(|cs| {
                        p.table
                            .borrow_ref_mut(cs)
                            .run_handler(port, &header, &mut pd)
                    })
                    .unwrap_or(Response::Nack(NackReason::UnknownPid));

                    // Discovery handlers answer with an ACK or stay silent
                    // (muted, out of range, malformed request); any other
                    // class must produce a response.
                    let invalid = matches!(handled, Response::Invalid)
                        || if request_class == RequestCommandClass::DiscoveryCommand {
                            !matches!(handled, Response::Ack | Response::None)
                        } else {
                            matches!(handled, Response::None)
                        };
                    if invalid {
                        fmt::warn!(
                            "PID 0x{:04x} returned an invalid response type",
                            header.pid
                        );
                        Response::Nack(NackReason::HardwareFault)
                    } else {
                        handled
                    }
                },
            }
        };

        let set_accepted = request_class == RequestCommandClass::SetCommand
            && matches!(response, Response::Ack);

        // Don't respond to non-discovery broadcasts, and never NACK a
        // discovery request.
        let response = if (header.dest_uid.is_broadcast()
            && header.pid != pids::DISC_UNIQUE_BRANCH)
            || (request_class == RequestCommandClass::DiscoveryCommand
                && !matches!(response, Response::Ack))
        {
            Response::None
        } else {
            response
        };

        let is_discovery_response = header.pid == pids::DISC_UNIQUE_BRANCH
            && request_class == RequestCommandClass::DiscoveryCommand;

        let response_size = match response {
            Response::None => 0,
            Response::Ack if is_discovery_response => {
                // In range and un-muted: reply with the preamble-framed EUID
                // frame, which `send` emits without a break.
                critical_section::with(|cs| {
                    let _core = p.core.borrow_ref(cs);
                    let buffer = unsafe { p.buffer() };
                    rdm_data::write_discovery_response(buffer, uid)
                })
            },
            response => {
                let (response_type, pd_out): (ResponseType, DataPack) = match response {
                    Response::Ack => (ResponseType::Ack, pd.clone()),
                    Response::AckOverflow => (ResponseType::AckOverflow, pd.clone()),
                    Response::AckTimer(delay) => (
                        ResponseType::AckTimer,
                        DataPack::from_slice(&delay.to_be_bytes()).unwrap(),
                    ),
                    Response::Nack(reason) => (ResponseType::NackReason, reason.serialize()),
                    _ => (
                        ResponseType::NackReason,
                        NackReason::HardwareFault.serialize(),
                    ),
                };

                let message_count = critical_section::with(|cs| {
                    p.table.borrow_ref(cs).queue_len().min(u8::MAX as usize) as u8
                });

                // Rewrite the header for the response; tn, sub_device and
                // pid stay untouched.
                header.dest_uid = request_header.src_uid;
                header.src_uid = PackageAddress::Device(uid);
                header.port_id = response_type as u8;
                header.message_count = message_count;
                header.cc = request_header.cc + 1;

                critical_section::with(|cs| {
                    let _core = p.core.borrow_ref(cs);
                    let buffer = unsafe { p.buffer() };
                    rdm_data::write_message(buffer, &header, &pd_out)
                })
            },
        };

        if response_size > 0 {
            if self.send(port, response_size) == 0 {
                let elapsed = critical_section::with(|cs| {
                    P::micros() - p.core.borrow_ref(cs).last_slot_ts
                });
                fmt::warn!(
                    "PID 0x{:04x} did not send a response ({} us since last slot)",
                    request_header.pid,
                    elapsed
                );
            } else {
                self.wait_sent(port, DMX_PACKET_TIMEOUT_US);
                critical_section::with(|cs| {
                    let mut core = p.core.borrow_ref_mut(cs);
                    core.head = -1; // wait for a break before reading data
                    p.uart.set_rts(true);
                });
            }
        }

        // Application callback, with the original request header.
        let callback = critical_section::with(|cs| {
            p.table.borrow_ref(cs).callback_of(request_header.pid)
        });
        if let Some((callback, context)) = callback {
            callback(port, &request_header, context);
        }

        // Persist accepted SETs of non-volatile parameters.
        if let Some(def) = definition {
            if def.nvs && set_accepted {
                let mut value = [0u8; RDM_MAX_PDL];
                let len = critical_section::with(|cs| {
                    p.table.borrow_ref(cs).read(def.pid, &mut value)
                });
                if len > 0 && !P::nvs_store(port, def.pid, &value[..len]) {
                    fmt::warn!("unable to save PID 0x{:04x}", def.pid);
                }
            }
        }

        true
    }

    /// Registers the responder parameters every RDM device carries and
    /// restores persisted values through the platform's storage hooks.
    pub(crate) fn register_default_parameters(&self, port: usize, config: &DmxConfig) {
        let p = self.port(port);

        let mut device_info = [0u8; 19];
        {
            let mut view = rdm_device_info_layout::View::new(&mut device_info[..]);
            view.protocol_version_mut().write(0x0100);
            view.device_model_id_mut().write(config.model_id);
            view.product_category_mut().write(config.product_category);
            view.software_version_id_mut().write(config.software_version_id);
            view.dmx_footprint_mut().write(config.dmx_footprint);
            view.current_personality_mut().write(config.current_personality);
            view.personality_count_mut().write(config.personality_count);
            view.dmx_start_address_mut().write(config.dmx_start_address);
            view.sub_device_count_mut().write(0);
            view.sensor_count_mut().write(0);
        }

        critical_section::with(|cs| {
            let mut table = p.table.borrow_ref_mut(cs);

            table.add_deterministic(ParameterDefinition {
                pid: pids::DISC_UNIQUE_BRANCH,
                cc: PidCc::Disc,
                data_type: DataType::NotDefined,
                pdl_size: 12,
                format: "uu$",
                nvs: false,
                response_handler: disc_unique_branch_handler,
            });
            table.add_deterministic(ParameterDefinition {
                pid: pids::DISC_MUTE,
                cc: PidCc::Disc,
                data_type: DataType::NotDefined,
                pdl_size: 2,
                format: "wv",
                nvs: false,
                response_handler: disc_mute_handler,
            });
            table.add_deterministic(ParameterDefinition {
                pid: pids::DISC_UN_MUTE,
                cc: PidCc::Disc,
                data_type: DataType::NotDefined,
                pdl_size: 2,
                format: "wv",
                nvs: false,
                response_handler: disc_un_mute_handler,
            });
            table.add_new(
                ParameterDefinition {
                    pid: pids::DEVICE_INFO,
                    cc: PidCc::Get,
                    data_type: DataType::NotDefined,
                    pdl_size: 19,
                    format: "x01x00wwlwbbwwb$",
                    nvs: false,
                    response_handler: simple_response_handler,
                },
                Some(&device_info),
            );
            // DMX_START_ADDRESS lives inside the DEVICE_INFO storage; the two
            // parameters share the same slab bytes.
            table.add_alias(
                ParameterDefinition {
                    pid: pids::DMX_START_ADDRESS,
                    cc: PidCc::GetSet,
                    data_type: DataType::UnsignedWord,
                    pdl_size: 2,
                    format: "w$",
                    nvs: true,
                    response_handler: dmx_start_address_handler,
                },
                pids::DEVICE_INFO,
                14,
            );
            table.add_new(
                ParameterDefinition {
                    pid: pids::SOFTWARE_VERSION_LABEL,
                    cc: PidCc::Get,
                    data_type: DataType::Ascii,
                    pdl_size: 32,
                    format: "a",
                    nvs: false,
                    response_handler: simple_response_handler,
                },
                Some(config.software_version_label.as_bytes()),
            );
            table.add_new(
                ParameterDefinition {
                    pid: pids::IDENTIFY_DEVICE,
                    cc: PidCc::GetSet,
                    data_type: DataType::UnsignedByte,
                    pdl_size: 1,
                    format: "b$",
                    nvs: false,
                    response_handler: identify_device_handler,
                },
                Some(&[0]),
            );
            table.update_callback(pids::IDENTIFY_DEVICE, default_identify_callback, None);
            table.add_deterministic(ParameterDefinition {
                pid: pids::SUPPORTED_PARAMETERS,
                cc: PidCc::Get,
                data_type: DataType::UnsignedWord,
                pdl_size: 0,
                format: "w",
                nvs: false,
                response_handler: supported_parameters_handler,
            });
        });

        // Restore the persisted start address, if any.
        let mut address = [0u8; 2];
        if P::nvs_load(port, pids::DMX_START_ADDRESS, &mut address) == Some(2) {
            let value = u16::from_be_bytes(address);
            if (1..=512).contains(&value) {
                critical_section::with(|cs| {
                    p.table
                        .borrow_ref_mut(cs)
                        .set(pids::DMX_START_ADDRESS, &address);
                });
            }
        }
    }
}

/// GET returns the stored value shaped by the parameter's format; SET
/// replaces it. Suits any plainly stored parameter.
pub fn simple_response_handler(
    ctx: &mut HandlerContext<'_>,
    header: &RdmHeader,
    pd: &mut DataPack,
) -> Response {
    match header.request_class() {
        Some(RequestCommandClass::GetCommand) => {
            let Some(param) = ctx.param.as_deref() else {
                return Response::Invalid;
            };

            let mut out = [0u8; RDM_MAX_PDL];
            let written = format::encode(&mut out, ctx.definition.format, param, false);
            pd.clear();
            pd.extend_from_slice(&out[..written]).unwrap();

            Response::Ack
        },
        Some(RequestCommandClass::SetCommand) => {
            let Some(param) = ctx.param.as_deref_mut() else {
                return Response::Invalid;
            };

            if ctx.definition.data_type == DataType::Ascii {
                let count = pd.len().min(param.len().saturating_sub(1));
                param[..count].copy_from_slice(&pd[..count]);
                param[count..].fill(0);
            } else {
                if pd.len() != param.len() {
                    return Response::Nack(NackReason::FormatError);
                }
                param.copy_from_slice(pd);
            }
            pd.clear();

            Response::Ack
        },
        _ => Response::Nack(NackReason::UnsupportedCommandClass),
    }
}

fn disc_unique_branch_handler(
    ctx: &mut HandlerContext<'_>,
    header: &RdmHeader,
    pd: &mut DataPack,
) -> Response {
    if header.request_class() != Some(RequestCommandClass::DiscoveryCommand) {
        return Response::Nack(NackReason::UnsupportedCommandClass);
    }
    if pd.len() != 12 || *ctx.discovery_muted {
        return Response::None;
    }

    let lower = u64::from(PackageAddress::from_bytes(pd[..6].try_into().unwrap()));
    let upper = u64::from(PackageAddress::from_bytes(pd[6..12].try_into().unwrap()));
    let own = u64::from(ctx.uid);

    if (lower..=upper).contains(&own) {
        pd.clear();
        Response::Ack
    } else {
        Response::None
    }
}

fn mute_control_field() -> [u8; 2] {
    let bits = MuteControlField::new()
        .with_managed_proxy(false)
        .with_sub_device(false)
        .with_boot_loader(false)
        .with_proxy_device(false)
        .into_bytes();

    // Bitfield bytes are least-significant first; the wire wants big-endian.
    [bits[1], bits[0]]
}

fn disc_mute_handler(
    ctx: &mut HandlerContext<'_>,
    header: &RdmHeader,
    pd: &mut DataPack,
) -> Response {
    if header.request_class() != Some(RequestCommandClass::DiscoveryCommand) {
        return Response::Nack(NackReason::UnsupportedCommandClass);
    }
    if !pd.is_empty() {
        return Response::None;
    }

    *ctx.discovery_muted = true;
    pd.extend_from_slice(&mute_control_field()).unwrap();

    Response::Ack
}

fn disc_un_mute_handler(
    ctx: &mut HandlerContext<'_>,
    header: &RdmHeader,
    pd: &mut DataPack,
) -> Response {
    if header.request_class() != Some(RequestCommandClass::DiscoveryCommand) {
        return Response::Nack(NackReason::UnsupportedCommandClass);
    }
    if !pd.is_empty() {
        return Response::None;
    }

    *ctx.discovery_muted = false;
    pd.extend_from_slice(&mute_control_field()).unwrap();

    Response::Ack
}

fn dmx_start_address_handler(
    ctx: &mut HandlerContext<'_>,
    header: &RdmHeader,
    pd: &mut DataPack,
) -> Response {
    if header.request_class() == Some(RequestCommandClass::SetCommand) {
        if pd.len() != 2 {
            return Response::Nack(NackReason::FormatError);
        }
        let address = u16::from_be_bytes(pd[..2].try_into().unwrap());
        if !(1..=512).contains(&address) {
            return Response::Nack(NackReason::DataOutOfRange);
        }
    }

    simple_response_handler(ctx, header, pd)
}

fn identify_device_handler(
    ctx: &mut HandlerContext<'_>,
    header: &RdmHeader,
    pd: &mut DataPack,
) -> Response {
    if header.request_class() == Some(RequestCommandClass::SetCommand) {
        if pd.len() != 1 {
            return Response::Nack(NackReason::FormatError);
        }
        if pd[0] > 1 {
            return Response::Nack(NackReason::DataOutOfRange);
        }
    }

    simple_response_handler(ctx, header, pd)
}

fn supported_parameters_handler(
    ctx: &mut HandlerContext<'_>,
    header: &RdmHeader,
    pd: &mut DataPack,
) -> Response {
    if header.request_class() != Some(RequestCommandClass::GetCommand) {
        return Response::Nack(NackReason::UnsupportedCommandClass);
    }

    // Discovery PIDs are never listed, E1.20 §10.4.1.
    const UNLISTED: [u16; 3] = [
        pids::DISC_UNIQUE_BRANCH,
        pids::DISC_MUTE,
        pids::DISC_UN_MUTE,
    ];

    pd.clear();
    for pid in ctx.registered_pids.iter().copied() {
        if UNLISTED.contains(&pid) {
            continue;
        }
        if pd.extend_from_slice(&pid.to_be_bytes()).is_err() {
            break;
        }
    }

    Response::Ack
}

fn default_identify_callback(port: usize, header: &RdmHeader, _context: Option<Context>) {
    if header.request_class() == Some(RequestCommandClass::SetCommand) {
        fmt::debug!("port {} identify device was updated", port);
    }
}
