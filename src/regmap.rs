//! Register-name correspondence between the two trace formats.
//!
//! The reference trace names CPU registers directly (`eax`, `esp`, ...) while
//! the simulation trace uses the IL's `R_*` names. The table is small and
//! fixed by construction so that resolution stays total and auditable.
//! Memory operands are never table entries; both sides derive the same
//! pseudo-register key from the operand address.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;

/// Fixed correspondence: reference-trace register name, simulation-trace
/// canonical name.
const REGISTER_TABLE: &[(&str, &str)] = &[
    ("eax", "R_EAX"),
    ("ebx", "R_EBX"),
    ("ecx", "R_ECX"),
    ("edx", "R_EDX"),
    ("esi", "R_ESI"),
    ("edi", "R_EDI"),
    ("ebp", "R_EBP"),
    ("esp", "R_ESP"),
    ("eip", "R_EIP"),
    ("eflags", "EFLAGS"),
];

lazy_static! {
    static ref REF_TO_SIM: BTreeMap<&'static str, &'static str> =
        REGISTER_TABLE.iter().copied().collect();
    static ref SIM_TO_REF: BTreeMap<&'static str, &'static str> =
        REGISTER_TABLE.iter().map(|&(r, s)| (s, r)).collect();
    /// IL memory operand, capturing the raw address.
    static ref MEMORY_OPERAND: Regex =
        Regex::new(r"^mem:\?u32\[(0x[0-9A-Fa-f]+):u32.*\]").unwrap();
    /// A bare (possibly `0x`-prefixed) address standing in for a memory
    /// operand on the reference side.
    static ref BARE_ADDRESS: Regex = Regex::new(r"^(?:0x)?[0-9A-Fa-f]{1,16}$").unwrap();
}

/// Derive the pseudo-register key for a memory operand address. Addresses
/// are normalized so both trace formats land on the same key.
pub fn memory_key(addr: u64) -> String {
    format!("mem[{:#x}]", addr)
}

fn parse_address(raw: &str) -> Option<u64> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16).ok()
}

/// Resolve a reference-trace key to the simulation trace's canonical name.
/// Register names go through the fixed table; anything that reads as a bare
/// hexadecimal address becomes a memory pseudo-key.
pub fn resolve_reference(raw: &str) -> Option<String> {
    let lower = raw.to_ascii_lowercase();
    if let Some(&canonical) = REF_TO_SIM.get(lower.as_str()) {
        return Some(canonical.to_owned());
    }
    if BARE_ADDRESS.is_match(&lower) {
        return Some(memory_key(parse_address(&lower)?));
    }
    None
}

/// Resolve a raw simulation-trace key to its canonical form: known `R_*`
/// names pass through, IL memory operands derive a pseudo-key, everything
/// else is unresolved.
pub fn resolve_simulation(raw: &str) -> Option<String> {
    if SIM_TO_REF.contains_key(raw) {
        return Some(raw.to_owned());
    }
    let caps = MEMORY_OPERAND.captures(raw)?;
    Some(memory_key(parse_address(&caps[1])?))
}

/// Reverse lookup: the reference trace's name for a canonical register key.
pub fn reference_name(canonical: &str) -> Option<&'static str> {
    SIM_TO_REF.get(canonical).copied()
}
