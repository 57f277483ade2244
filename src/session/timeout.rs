// Copyright (c) 2025 Dataplane Core Contributors
//
// Session timeout selection

use serde::{Deserialize, Serialize};

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_ACK: u8 = 0x10;

/// Per-state session timeouts, in timestamp ticks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTimeouts {
    pub udp: u64,
    pub tcp_syn_ack: u64,
    pub tcp_syn: u64,
    pub tcp_fin: u64,
    pub tcp: u64,
    pub default: u64,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            udp: 300,
            tcp_syn_ack: 60,
            tcp_syn: 45,
            tcp_fin: 120,
            tcp: 7200,
            default: 300,
        }
    }
}

impl SessionTimeouts {
    /// Pick the timeout for a packet's transport protocol and, for
    /// TCP, its flags. Match order: SYN+ACK before SYN before FIN
    /// before the established default.
    pub fn select(&self, proto: u8, tcp_flags: u8) -> u64 {
        match proto {
            IPPROTO_UDP => self.udp,
            IPPROTO_TCP => {
                if tcp_flags & TCP_SYN != 0 && tcp_flags & TCP_ACK != 0 {
                    self.tcp_syn_ack
                } else if tcp_flags & TCP_SYN != 0 {
                    self.tcp_syn
                } else if tcp_flags & TCP_FIN != 0 {
                    self.tcp_fin
                } else {
                    self.tcp
                }
            }
            _ => self.default,
        }
    }
}
