use std::fmt::{Debug, Display, Formatter};

/// Identifies a database instance within the cluster.
///
/// Client connections have no instance identity; they carry
/// [InstanceId::INVALID] until (and unless) an identity is learned from the
/// first frame they send.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct InstanceId(pub u64);

impl InstanceId {
    pub const INVALID: InstanceId = InstanceId(u64::MAX);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl Debug for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "instance {}", self.0)
        }
        else {
            write!(f, "instance ?")
        }
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Identifies an application-level query. The transport core treats it as
/// opaque: it is carried in frame headers and used as the key for attached
/// client queries.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct QueryId(pub u64);

impl QueryId {
    /// Messages that do not belong to any query carry this value.
    pub const NONE: QueryId = QueryId(0);
}

impl Debug for QueryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "query {}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::regular(InstanceId(17), true, "instance 17")]
    #[case::zero(InstanceId(0), true, "instance 0")]
    #[case::invalid(InstanceId::INVALID, false, "instance ?")]
    fn test_instance_id(#[case] id: InstanceId, #[case] valid: bool, #[case] formatted: &str) {
        assert_eq!(id.is_valid(), valid);
        assert_eq!(format!("{:?}", id), formatted);
        assert_eq!(format!("{}", id), formatted);
    }
}
