/// Returns the highest power of two less than or equal to the value, or 0
/// for a zero input.
pub fn get_power_of_two_64(value: u64) -> u64 {
    if value == 0 {
        return 0;
    }

    1u64 << high_bit_set_64(value)
}

/// Returns the bit position of the highest bit set in a 64-bit value.
/// Equivalent to log2(x).
///
/// # Returns
///
/// * A value between 0 and 63 if the highest bit is found.
/// * -1 if `operand` is zero.
pub fn high_bit_set_64(operand: u64) -> i32 {
    if operand == 0 {
        return -1;
    }

    63 - operand.leading_zeros() as i32
}

/// Return the biggest alignment (lowest set bit) of address.
/// The function is equivalent to: 1 << LowBitSet64 (Address).
///
/// - `address` -    The address to return the alignment.
/// - `alignment0` - The alignment to return when Address is 0.
pub fn biggest_alignment(address: u64, alignment0: u64) -> u64 {
    if address == 0 {
        alignment0
    } else {
        address & address.wrapping_neg()
    }
}
