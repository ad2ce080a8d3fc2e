//! # wifid
//!
//! Supervises one hostapd child that owns every physical radio. The daemon
//! discovers device capabilities, scores radios onto bands, picks channels
//! by observed RF congestion, generates hostapd's config/VLAN/PSK files,
//! and drives the control sockets: liveness pings, station polls,
//! disassociations, and the unsolicited station event stream that feeds
//! `net.entity` and `net.exception`.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod channel;
pub mod ctrl;
pub mod device;
pub mod hostapd;
pub mod retransmit;
pub mod supervisor;

pub use device::{Band, DeviceCaps, DeviceState};
pub use retransmit::{RetransmitAction, RetransmitTracker};
pub use supervisor::WifiSupervisor;

use thiserror::Error;

/// Wi-Fi supervision failures.
#[derive(Debug, Error)]
pub enum WifiError {
    /// control socket io
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// hostapd did not answer a control command in time
    #[error("control command {0} timed out")]
    CtrlTimeout(String),
    /// hostapd rejected a control command
    #[error("control command {cmd} failed: {reply}")]
    CtrlRejected {
        /// the command sent
        cmd: String,
        /// what hostapd said
        reply: String,
    },
    /// no radio can serve any band
    #[error("no usable radio")]
    NoUsableRadio,
    /// process control failed
    #[error(transparent)]
    Proc(#[from] procmon::ProcError),
    /// tree access failed
    #[error(transparent)]
    Tree(#[from] cfgtree::TreeError),
}
