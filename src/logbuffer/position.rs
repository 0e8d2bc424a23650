//! Bijection between `(termId, termOffset)` and 64-bit stream positions.
//!
//! Term ids advance with 32-bit wrap; subtracting the initial term id before
//! sign extension keeps positions monotone across the wrap.

pub const PARTITION_COUNT: usize = 3;

pub fn position_bits_to_shift(term_length: usize) -> u32 {
    debug_assert!(term_length.is_power_of_two());
    term_length.trailing_zeros()
}

pub fn compute_term_count(term_id: i32, initial_term_id: i32) -> i32 {
    term_id.wrapping_sub(initial_term_id)
}

pub fn compute_position(
    term_id: i32,
    term_offset: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    let term_count = compute_term_count(term_id, initial_term_id) as i64;
    (term_count << position_bits_to_shift) + term_offset as i64
}

pub fn compute_term_begin_position(
    term_id: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    compute_position(term_id, 0, position_bits_to_shift, initial_term_id)
}

pub fn compute_term_id_from_position(
    position: i64,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i32 {
    ((position >> position_bits_to_shift) as i32).wrapping_add(initial_term_id)
}

pub fn compute_term_offset_from_position(position: i64, position_bits_to_shift: u32) -> i32 {
    (position & ((1i64 << position_bits_to_shift) - 1)) as i32
}

pub fn index_by_position(position: i64, position_bits_to_shift: u32) -> usize {
    ((position >> position_bits_to_shift) as u64 % PARTITION_COUNT as u64) as usize
}

pub fn index_by_term(initial_term_id: i32, active_term_id: i32) -> usize {
    index_by_term_count(compute_term_count(active_term_id, initial_term_id))
}

pub fn index_by_term_count(term_count: i32) -> usize {
    (term_count as u32 as u64 % PARTITION_COUNT as u64) as usize
}

/// `rawTail` packs `(termId << 32) | termOffset`.
pub fn pack_tail(term_id: i32, term_offset: i32) -> i64 {
    ((term_id as i64) << 32) | (term_offset as u32 as i64)
}

pub fn term_id(raw_tail: i64) -> i32 {
    (raw_tail >> 32) as i32
}

/// Tail offset clamped to the term length; `== term_length` means sealed.
pub fn term_offset(raw_tail: i64, term_length: usize) -> i32 {
    let tail = raw_tail & 0xFFFF_FFFF;
    std::cmp::min(tail, term_length as i64) as i32
}
