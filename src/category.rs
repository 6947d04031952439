use std::fmt::{Display, Formatter};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Traffic classes for priority scheduling and independent rate limiting. The numeric value is
///  the priority (lower is serviced first) and the index into per-category arrays.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Ord, PartialOrd, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ThrottleCategory {
    Resend = 0,
    Land = 1,
    Wind = 2,
    Cloud = 3,
    Task = 4,
    Texture = 5,
    Asset = 6,
    /// ACKs, pings and other protocol control traffic. This pseudo-category has no queue and
    ///  bypasses per-category throttling.
    Unknown = 7,
}

impl ThrottleCategory {
    /// number of queued / throttled categories, i.e. all except [ThrottleCategory::Unknown]
    pub const COUNT: usize = 7;

    /// the throttled categories in priority order
    pub const ALL: [ThrottleCategory; Self::COUNT] = [
        ThrottleCategory::Resend,
        ThrottleCategory::Land,
        ThrottleCategory::Wind,
        ThrottleCategory::Cloud,
        ThrottleCategory::Task,
        ThrottleCategory::Texture,
        ThrottleCategory::Asset,
    ];

    pub fn index(self) -> usize {
        u8::from(self) as usize
    }

    pub fn is_throttled(self) -> bool {
        self != ThrottleCategory::Unknown
    }

    /// The lowest rate (bytes per second) a category can be negotiated down to. Categories that
    ///  routinely carry full-size packets are floored at roughly one MTU per second.
    pub fn rate_floor(self) -> u64 {
        match self {
            ThrottleCategory::Resend => 1000,
            ThrottleCategory::Land => 50,
            ThrottleCategory::Wind => 50,
            ThrottleCategory::Cloud => 50,
            ThrottleCategory::Task => 1000,
            ThrottleCategory::Texture => 1000,
            ThrottleCategory::Asset => 1000,
            ThrottleCategory::Unknown => 0,
        }
    }
}

impl Display for ThrottleCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, Some(ThrottleCategory::Resend))]
    #[case(4, Some(ThrottleCategory::Task))]
    #[case(6, Some(ThrottleCategory::Asset))]
    #[case(7, Some(ThrottleCategory::Unknown))]
    #[case(8, None)]
    #[case(255, None)]
    fn test_try_from(#[case] raw: u8, #[case] expected: Option<ThrottleCategory>) {
        assert_eq!(ThrottleCategory::try_from(raw).ok(), expected);
    }

    #[test]
    fn test_all_in_priority_order() {
        for (i, category) in ThrottleCategory::ALL.iter().enumerate() {
            assert_eq!(category.index(), i);
            assert!(category.is_throttled());
        }
        assert!(!ThrottleCategory::Unknown.is_throttled());
    }
}
