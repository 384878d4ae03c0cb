use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(
        $(#[$attr:meta])*
        $vis:vis struct $name:ident($ty:ty) = $prefix:literal;
    )*) => {$(
        $(#[$attr])*
        #[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        $vis struct $name(pub $ty);

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }

        impl From<$ty> for $name {
            fn from(raw: $ty) -> Self {
                Self(raw)
            }
        }
    )*};
}

define_id! {
    /// Rank of a metadata server within the cluster.
    pub struct MdsRank(i32) = "mds.";

    /// Inode number as assigned by the metadata servers.
    pub struct InodeId(u64) = "ino:";

    /// Capability id, unique per session.
    pub struct CapId(u64) = "cap:";

    /// Transaction id of a metadata request.
    pub struct Tid(u64) = "tid:";

    /// Opaque connection handle owned by the network layer.
    pub struct ConnectionHandle(u64) = "con:";
}
