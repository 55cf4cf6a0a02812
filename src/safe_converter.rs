/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u8> for usize {
    fn prechecked_cast(self) -> u8 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

/// Distance from `from` to `to` in the modulo 256 sequence number space
pub fn seq_distance(from: u8, to: u8) -> u8 {
    to.wrapping_sub(from)
}
