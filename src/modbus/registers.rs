//! Register request planning and composite register decoding.
//!
//! Registers are addressed the way they are *named* on the device, which is
//! 1-indexed, while the wire request is 0-indexed. A named register may also
//! be wider than one 16-bit word: register `0xC550` with width 2 occupies
//! `0xC550` and `0xC551`, most significant word first, and the next meaningful
//! register is `0xC552`.

use log::debug;
use std::collections::BTreeMap;

use super::client::RegisterTransport;
use crate::utils::error::ModbusError;

/// Largest number of registers a single read request may cover.
pub const MAX_REGISTERS_PER_REQUEST: u32 = 125;

/// Values are decoded into a `u64`, so a register may span at most four words.
pub const MAX_REGISTER_WIDTH: u16 = 4;

/// Named (1-indexed) register addresses mapped to their width in words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMap {
    widths: BTreeMap<u16, u16>,
}

impl RegisterMap {
    pub fn new<I>(registers: I) -> Result<Self, ModbusError>
    where
        I: IntoIterator<Item = (u16, u16)>,
    {
        let mut widths = BTreeMap::new();

        for (addr, width) in registers {
            if addr == 0 {
                return Err(ModbusError::ConfigError(
                    "Register names start at 1, got address 0".to_string(),
                ));
            }
            if width == 0 || width > MAX_REGISTER_WIDTH {
                return Err(ModbusError::ConfigError(format!(
                    "Register 0x{:04X} has width {}, expected 1..={}",
                    addr, width, MAX_REGISTER_WIDTH
                )));
            }
            if addr as u32 + width as u32 - 1 > u16::MAX as u32 {
                return Err(ModbusError::ConfigError(format!(
                    "Register 0x{:04X} with width {} runs past the address space",
                    addr, width
                )));
            }
            if widths.insert(addr, width).is_some() {
                return Err(ModbusError::ConfigError(format!(
                    "Register 0x{:04X} listed more than once",
                    addr
                )));
            }
        }

        if widths.is_empty() {
            return Err(ModbusError::ConfigError(
                "A register map needs at least one register".to_string(),
            ));
        }

        // Overlapping registers would make the span smaller than the words the decoder reads.
        let mut previous_end: Option<(u16, u32)> = None;
        for (&addr, &width) in &widths {
            if let Some((previous, end)) = previous_end {
                if (addr as u32) < end {
                    return Err(ModbusError::ConfigError(format!(
                        "Register 0x{:04X} overlaps register 0x{:04X}",
                        addr, previous
                    )));
                }
            }
            previous_end = Some((addr, addr as u32 + width as u32));
        }

        Ok(Self { widths })
    }

    pub fn min_addr(&self) -> u16 {
        self.widths.keys().next().copied().unwrap_or_default()
    }

    pub fn max_addr(&self) -> u16 {
        self.widths.keys().next_back().copied().unwrap_or_default()
    }

    pub fn width(&self, addr: u16) -> Option<u16> {
        self.widths.get(&addr).copied()
    }

    pub fn contains(&self, addr: u16) -> bool {
        self.widths.contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.widths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.widths.iter().map(|(&addr, &width)| (addr, width))
    }

    /// Number of contiguous wire words needed to cover every register.
    pub fn span(&self) -> u32 {
        let max_addr = self.max_addr();
        let max_width = self.width(max_addr).unwrap_or(1);
        max_addr as u32 + max_width as u32 - self.min_addr() as u32
    }

    /// 0-indexed wire address of the first requested word.
    pub fn wire_start(&self) -> u16 {
        self.min_addr() - 1
    }

    /// Splits the map, in address order, into sub-maps whose span fits `max_span`.
    pub fn chunks(&self, max_span: u32) -> Vec<RegisterMap> {
        let mut chunks = Vec::new();
        let mut current: BTreeMap<u16, u16> = BTreeMap::new();
        let mut chunk_start: u32 = 0;

        for (addr, width) in self.iter() {
            let end = addr as u32 + width as u32;
            if !current.is_empty() && end - chunk_start > max_span {
                chunks.push(RegisterMap {
                    widths: std::mem::take(&mut current),
                });
            }
            if current.is_empty() {
                chunk_start = addr as u32;
            }
            current.insert(addr, width);
        }

        if !current.is_empty() {
            chunks.push(RegisterMap { widths: current });
        }

        chunks
    }
}

/// Raw words of a read together with the map that produced the request.
#[derive(Debug, Clone)]
pub struct RegisterResponse {
    words: Vec<u16>,
    registers: RegisterMap,
    min_addr: u16,
}

impl RegisterResponse {
    pub fn new(words: Vec<u16>, registers: RegisterMap) -> Result<Self, ModbusError> {
        let span = registers.span() as usize;
        if words.len() < span {
            return Err(ModbusError::InvalidResponse(format!(
                "Expected {} registers, received {}",
                span,
                words.len()
            )));
        }

        let min_addr = registers.min_addr();
        Ok(Self {
            words,
            registers,
            min_addr,
        })
    }

    /// Decoded value of the named register `addr`, most significant word first.
    ///
    /// Panics when `addr` was not part of the request.
    pub fn value_at(&self, addr: u16) -> u64 {
        let width = self.registers.width(addr);
        assert!(
            width.is_some(),
            "register 0x{:04X} was not part of the request",
            addr
        );

        let offset = (addr - self.min_addr) as usize;
        self.words[offset..offset + width.unwrap_or_default() as usize]
            .iter()
            .fold(0u64, |acc, &word| (acc << 16) | word as u64)
    }

    pub fn values(&self) -> BTreeMap<u16, u64> {
        self.registers
            .iter()
            .map(|(addr, _)| (addr, self.value_at(addr)))
            .collect()
    }

    pub fn raw_words(&self) -> &[u16] {
        &self.words
    }
}

/// Requests the given named registers from `unit` in a single read.
///
/// Fails with `RequestTooLarge` without touching the transport when the
/// registers do not fit in one request. No retry happens here.
pub async fn read_registers<T>(
    client: &T,
    unit: u8,
    registers: &RegisterMap,
) -> Result<RegisterResponse, ModbusError>
where
    T: RegisterTransport + ?Sized,
{
    let span = registers.span();
    if span > MAX_REGISTERS_PER_REQUEST {
        return Err(ModbusError::RequestTooLarge {
            span,
            max: MAX_REGISTERS_PER_REQUEST,
        });
    }

    debug!(
        "Requesting {} registers from unit {} at wire address {}",
        span,
        unit,
        registers.wire_start()
    );

    let words = client
        .read_registers(unit, registers.wire_start(), span as u16)
        .await?;

    RegisterResponse::new(words, registers.clone())
}
