//! Identifier types
//!
//! Counters, channels, memory handles and contexts are small integers
//! indexing fixed tables. Each gets a transparent newtype so they cannot
//! be mixed up at call sites. `u32::MAX` is the "none" sentinel.

use core::fmt;

macro_rules! index_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Sentinel meaning "no id"
            pub const NONE: $name = $name(u32::MAX);

            #[inline]
            pub const fn new(id: u32) -> Self {
                $name(id)
            }

            #[inline]
            pub const fn as_u32(self) -> u32 {
                self.0
            }

            /// Get as usize for table indexing
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0 as usize
            }

            #[inline]
            pub const fn is_none(self) -> bool {
                self.0 == u32::MAX
            }

            #[inline]
            pub const fn to_option(self) -> Option<$name> {
                if self.is_none() {
                    None
                } else {
                    Some(self)
                }
            }
        }

        impl From<u32> for $name {
            #[inline]
            fn from(id: u32) -> Self {
                $name(id)
            }
        }

        impl From<$name> for u32 {
            #[inline]
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_none() {
                    write!(f, concat!(stringify!($name), "(NONE)"))
                } else {
                    write!(f, concat!(stringify!($name), "({})"), self.0)
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_none() {
                    write!(f, concat!($label, "-none"))
                } else {
                    write!(f, concat!($label, "{}"), self.0)
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::NONE
            }
        }
    };
}

index_id!(
    /// Completion counter in the 32-entry hardware namespace
    CounterId, "sp"
);
index_id!(
    /// Physical command channel
    ChannelId, "ch"
);
index_id!(
    /// Opaque memory handle owned by the `MemoryManager`
    MemHandle, "mem"
);
index_id!(
    /// Slot in the context table
    ContextId, "ctx"
);

/// Client engine families that sit behind the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleKind {
    /// The host itself (clock gate only)
    Host,
    Display,
    Dsi,
    Gr2d,
    Gr3d,
    Mpe,
    Vi,
    Isp,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 8] = [
        ModuleKind::Host,
        ModuleKind::Display,
        ModuleKind::Dsi,
        ModuleKind::Gr2d,
        ModuleKind::Gr3d,
        ModuleKind::Mpe,
        ModuleKind::Vi,
        ModuleKind::Isp,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ModuleKind::Host => "host",
            ModuleKind::Display => "display",
            ModuleKind::Dsi => "dsi",
            ModuleKind::Gr2d => "2d",
            ModuleKind::Gr3d => "3d",
            ModuleKind::Mpe => "mpe",
            ModuleKind::Vi => "vi",
            ModuleKind::Isp => "isp",
        }
    }

    /// Engines whose register state can be saved and restored
    pub fn is_context_switched(self) -> bool {
        matches!(self, ModuleKind::Gr3d | ModuleKind::Mpe)
    }

    /// Display power is owned by the display driver; the power
    /// scheduler only tracks its busy flag.
    pub fn is_externally_powered(self) -> bool {
        matches!(self, ModuleKind::Display)
    }
}

impl core::str::FromStr for ModuleKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModuleKind::ALL
            .iter()
            .copied()
            .find(|m| m.name().eq_ignore_ascii_case(s.trim()))
            .ok_or(())
    }
}

/// One instance of a client engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId {
    pub kind: ModuleKind,
    pub instance: u8,
}

impl ModuleId {
    pub const HOST: ModuleId = ModuleId::new(ModuleKind::Host, 0);

    #[inline]
    pub const fn new(kind: ModuleKind, instance: u8) -> Self {
        ModuleId { kind, instance }
    }
}

impl From<ModuleKind> for ModuleId {
    fn from(kind: ModuleKind) -> Self {
        ModuleId::new(kind, 0)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.name(), self.instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_id_basics() {
        let id = CounterId::new(7);
        assert_eq!(id.as_u32(), 7);
        assert_eq!(id.as_usize(), 7);
        assert!(!id.is_none());
        assert_eq!(format!("{}", id), "sp7");
        assert_eq!(format!("{:?}", id), "CounterId(7)");
    }

    #[test]
    fn test_none_sentinel() {
        assert!(ChannelId::default().is_none());
        assert_eq!(ChannelId::NONE.to_option(), None);
        assert_eq!(format!("{}", MemHandle::NONE), "mem-none");
        assert_eq!(format!("{:?}", ContextId::NONE), "ContextId(NONE)");
    }

    #[test]
    fn test_conversions() {
        let ch: ChannelId = 3u32.into();
        let raw: u32 = ch.into();
        assert_eq!(raw, 3);
    }

    #[test]
    fn test_module_names() {
        assert_eq!("DSI".parse::<ModuleKind>(), Ok(ModuleKind::Dsi));
        assert_eq!("3d".parse::<ModuleKind>(), Ok(ModuleKind::Gr3d));
        assert!("gpu".parse::<ModuleKind>().is_err());
        assert_eq!(format!("{}", ModuleId::new(ModuleKind::Display, 1)), "display:1");
        assert!(ModuleKind::Gr3d.is_context_switched());
        assert!(!ModuleKind::Gr2d.is_context_switched());
    }
}
