use submerge_lang::ClockSource;

/// A `ClockSource` a test controls by hand, for deterministic push-ID and
/// sentinel-resolution assertions (spec.md §8's S4 scenario).
pub struct FakeClock {
    millis: i64,
    next_byte: u8,
    byte_step: u8,
}

impl FakeClock {
    pub fn new(millis: i64) -> FakeClock {
        FakeClock { millis, next_byte: 0, byte_step: 1 }
    }

    pub fn set_millis(&mut self, millis: i64) {
        self.millis = millis;
    }

    pub fn advance_millis(&mut self, delta: i64) {
        self.millis += delta;
    }
}

impl ClockSource for FakeClock {
    fn now_millis(&mut self) -> i64 {
        self.millis
    }

    fn random_byte(&mut self) -> u8 {
        let b = self.next_byte;
        self.next_byte = self.next_byte.wrapping_add(self.byte_step);
        b
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use submerge_lang::PushIdGenerator;

    #[test]
    fn fake_clock_drives_push_id_generation_deterministically() {
        let mut gen = PushIdGenerator::new(FakeClock::new(1_000));
        let id = gen.next();
        assert_eq!(id.as_str().len(), 20);
    }
}
