use std::fmt;

/// Lending status of a physical unit. The numeric codes are what the store
/// persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Useable {
    Loaned,
    Available,
    Repair,
    Scrapped,
    Pending,
}

impl Useable {
    pub const ALL: [Useable; 5] = [
        Useable::Loaned,
        Useable::Available,
        Useable::Repair,
        Useable::Scrapped,
        Useable::Pending,
    ];

    pub fn code(self) -> i64 {
        match self {
            Useable::Loaned => 0,
            Useable::Available => 1,
            Useable::Repair => 2,
            Useable::Scrapped => 3,
            Useable::Pending => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|u| u.code() == code)
    }

    pub fn label(self) -> &'static str {
        match self {
            Useable::Loaned => "loaned",
            Useable::Available => "available",
            Useable::Repair => "repair",
            Useable::Scrapped => "scrapped",
            Useable::Pending => "pending",
        }
    }
}

impl fmt::Display for Useable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for u in Useable::ALL {
            assert_eq!(Useable::from_code(u.code()), Some(u));
        }
        assert_eq!(Useable::from_code(9), None);
        assert_eq!(Useable::Available.code(), 1);
        assert_eq!(Useable::Loaned.code(), 0);
    }
}
