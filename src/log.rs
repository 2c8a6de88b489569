//! Logging shim: [`defmt`](https://docs.rs/defmt) on the target, the [`log`] facade elsewhere.
//!
//! Format strings must stick to `{}` and `{:?}` so both backends accept them.
#![allow(clippy::single_component_path_imports)]

#[macro_use]
mod _log {
    #[cfg(feature = "trace_samples")]
    macro_rules! trace {
        ($($arg:tt)+) => {{
            #[cfg(feature = "defmt")]
            ::defmt::trace!($($arg)+);
            #[cfg(not(feature = "defmt"))]
            ::log::trace!($($arg)+);
        }};
    }

    macro_rules! debug {
        ($($arg:tt)+) => {{
            #[cfg(feature = "defmt")]
            ::defmt::debug!($($arg)+);
            #[cfg(not(feature = "defmt"))]
            ::log::debug!($($arg)+);
        }};
    }

    macro_rules! info {
        ($($arg:tt)+) => {{
            #[cfg(feature = "defmt")]
            ::defmt::info!($($arg)+);
            #[cfg(not(feature = "defmt"))]
            ::log::info!($($arg)+);
        }};
    }

    macro_rules! warn_ {
        ($($arg:tt)+) => {{
            #[cfg(feature = "defmt")]
            ::defmt::warn!($($arg)+);
            #[cfg(not(feature = "defmt"))]
            ::log::warn!($($arg)+);
        }};
    }

    macro_rules! error {
        ($($arg:tt)+) => {{
            #[cfg(feature = "defmt")]
            ::defmt::error!($($arg)+);
            #[cfg(not(feature = "defmt"))]
            ::log::error!($($arg)+);
        }};
    }
}

pub(crate) use debug;
pub(crate) use error;
pub(crate) use info;
#[cfg(feature = "trace_samples")]
pub(crate) use trace;
pub(crate) use warn_ as warn;
