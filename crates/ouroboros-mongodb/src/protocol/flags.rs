//! Bit flags carried by wire messages

macro_rules! wire_flags {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* const $flag:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            $($(#[$fmeta])* pub const $flag: Self = Self($value);)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            /// Unknown bits are kept as-is
            pub const fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

wire_flags! {
    /// Flags on a query message
    QueryFlags {
        const TAILABLE_CURSOR = 2;
        /// Allow the query to run on a secondary
        const SLAVE_OK = 4;
        const NO_CURSOR_TIMEOUT = 16;
        const AWAIT_DATA = 32;
        const EXHAUST = 64;
        const PARTIAL = 128;
    }
}

wire_flags! {
    /// Flags on a reply message
    ReplyFlags {
        const CURSOR_NOT_FOUND = 1;
        /// The single returned document is an `$err` document
        const QUERY_FAILURE = 2;
        const AWAIT_CAPABLE = 8;
    }
}

wire_flags! {
    InsertFlags {
        const CONTINUE_ON_ERROR = 1;
    }
}

wire_flags! {
    UpdateFlags {
        const UPSERT = 1;
        const MULTI = 2;
    }
}

wire_flags! {
    DeleteFlags {
        const SINGLE_REMOVE = 1;
    }
}
