/// Reserved GREASE code points (RFC 8701).
///
/// Both bytes are equal and their low nibble is 0xA: 0x0A0A, 0x1A1A, ... 0xFAFA.
/// The same set is reserved for cipher suites, extensions and named groups.
pub fn is_grease(val: u16) -> bool {
    let [hi, lo] = val.to_be_bytes();
    hi == lo && lo & 0x0F == 0x0A
}

/// Copy `values` in order, leaving out GREASE code points.
pub fn strip_grease(values: &[u16]) -> Vec<u16> {
    values.iter().copied().filter(|v| !is_grease(*v)).collect()
}
