//! Action capability declarations
//!
//! Capabilities are the sandbox contract an action executes under: what it
//! may reach and how much of the machine it may use. They travel with every
//! `ActionRequest` and feed worker selection, and they are part of the
//! content address of an action.

use crate::remote::wire::{self, WireResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::time::Duration;

const FLAG_NETWORK: u8 = 0b0000_0001;
const FLAG_WRITE_HOME: u8 = 0b0000_0010;
const FLAG_WRITE_TMP: u8 = 0b0000_0100;

/// Sandbox contract for one action
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// May open network connections
    pub network: bool,
    /// May write under the invoking user's home
    pub write_home: bool,
    /// May write under the system temp directory
    pub write_tmp: bool,
    /// Extra paths readable beyond declared inputs
    pub read_paths: Vec<String>,
    /// Extra paths writable beyond declared outputs
    pub write_paths: Vec<String>,
    /// CPU budget in millicores; 0 = unlimited
    pub max_cpu: u64,
    /// Memory budget in bytes; 0 = unlimited
    pub max_memory: u64,
    /// Wall-clock budget; zero = unlimited
    pub timeout: Duration,
}

impl Capabilities {
    /// A fully open sandbox, for trusted local execution
    pub fn unrestricted() -> Self {
        Self {
            network: true,
            write_home: true,
            write_tmp: true,
            ..Self::default()
        }
    }

    /// Whether this action declares a memory budget
    pub fn is_memory_bound(&self) -> bool {
        self.max_memory > 0
    }

    /// Whether this action declares a CPU budget
    pub fn is_cpu_bound(&self) -> bool {
        self.max_cpu > 0
    }

    /// Serialize: flag byte, two path arrays, three 8-byte numerics
    pub fn encode<W: Write>(&self, w: &mut W) -> WireResult<()> {
        let mut flags = 0u8;
        if self.network {
            flags |= FLAG_NETWORK;
        }
        if self.write_home {
            flags |= FLAG_WRITE_HOME;
        }
        if self.write_tmp {
            flags |= FLAG_WRITE_TMP;
        }
        w.write_u8(flags)?;
        wire::write_string_list(w, &self.read_paths)?;
        wire::write_string_list(w, &self.write_paths)?;
        w.write_u64::<BigEndian>(self.max_cpu)?;
        w.write_u64::<BigEndian>(self.max_memory)?;
        w.write_u64::<BigEndian>(self.timeout.as_millis() as u64)?;
        Ok(())
    }

    /// Deserialize the layout written by `encode`
    pub fn decode<R: Read>(r: &mut R) -> WireResult<Self> {
        let flags = r.read_u8()?;
        let read_paths = wire::read_string_list(r)?;
        let write_paths = wire::read_string_list(r)?;
        let max_cpu = r.read_u64::<BigEndian>()?;
        let max_memory = r.read_u64::<BigEndian>()?;
        let timeout_ms = r.read_u64::<BigEndian>()?;
        Ok(Self {
            network: flags & FLAG_NETWORK != 0,
            write_home: flags & FLAG_WRITE_HOME != 0,
            write_tmp: flags & FLAG_WRITE_TMP != 0,
            read_paths,
            write_paths,
            max_cpu,
            max_memory,
            timeout: Duration::from_millis(timeout_ms),
        })
    }

    /// Serialize into a fresh buffer; used for content addressing
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // Writing to a Vec cannot fail.
        self.encode(&mut buf).expect("encode to Vec");
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_round_trip_identity() {
        let caps = Capabilities {
            network: true,
            write_home: false,
            write_tmp: true,
            read_paths: vec!["/usr/include".to_string(), "/opt/sdk".to_string()],
            write_paths: vec!["/workspace/out".to_string()],
            max_cpu: 4000,
            max_memory: 2 * 1024 * 1024 * 1024,
            timeout: Duration::from_secs(300),
        };

        let bytes = caps.to_bytes();
        let back = Capabilities::decode(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(back, caps);
    }

    #[test]
    fn test_default_round_trip() {
        let caps = Capabilities::default();
        let back = Capabilities::decode(&mut Cursor::new(&caps.to_bytes())).unwrap();
        assert_eq!(back, caps);
    }

    #[test]
    fn test_flag_bits_are_independent() {
        for (network, write_home, write_tmp) in [
            (true, false, false),
            (false, true, false),
            (false, false, true),
            (true, true, true),
        ] {
            let caps = Capabilities {
                network,
                write_home,
                write_tmp,
                ..Capabilities::default()
            };
            let back = Capabilities::decode(&mut Cursor::new(&caps.to_bytes())).unwrap();
            assert_eq!(back.network, network);
            assert_eq!(back.write_home, write_home);
            assert_eq!(back.write_tmp, write_tmp);
        }
    }

    #[test]
    fn test_encoding_is_content_stable() {
        let a = Capabilities::unrestricted();
        let b = Capabilities::unrestricted();
        assert_eq!(a.to_bytes(), b.to_bytes());
    }
}
