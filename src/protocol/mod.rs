//! Wire format shared by the control plane and host agents.
//!
//! A packet is `MAGIC(11) | i32 code | u32 payload_len | payload`, all
//! integers big-endian. Connections start with a password-challenge
//! handshake (see [`auth`]).

pub mod auth;
pub mod packet;
pub mod value;

pub use auth::{client_handshake, server_handshake};
pub use packet::{
    recv_data, recv_packet, send_data, send_packet, Command, Packet, PacketCodec, MAGIC,
};
pub use value::{CallEnvelope, Value};
