//! Logging interface, contingent on the `defmt-03` feature
//!
//! Only enable logging when debugging, and when you're certain that
//! your logging transport isn't the USB device itself!

macro_rules! trace {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt-03")]
        ::defmt_03::trace!($($args)*)
    };
}

macro_rules! debug {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt-03")]
        ::defmt_03::debug!($($args)*)
    };
}

macro_rules! warn {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt-03")]
        ::defmt_03::warn!($($args)*)
    };
}
