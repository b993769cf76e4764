#![allow(unused_macros)]

#[cfg(feature = "defmt-logging")]
macro_rules! nut_log {
    (trace, $fmt:literal $(, $arg:expr)*) => { defmt::trace!($fmt $(, $arg)*) };
    (debug, $fmt:literal $(, $arg:expr)*) => { defmt::debug!($fmt $(, $arg)*) };
    (info,  $fmt:literal $(, $arg:expr)*) => { defmt::info!($fmt $(, $arg)*) };
    (warn,  $fmt:literal $(, $arg:expr)*) => { defmt::warn!($fmt $(, $arg)*) };
    (error, $fmt:literal $(, $arg:expr)*) => { defmt::error!($fmt $(, $arg)*) };
}

#[cfg(all(feature = "log", not(feature = "defmt-logging")))]
macro_rules! nut_log {
    (trace, $fmt:literal $(, $arg:expr)*) => { log::trace!($fmt $(, $arg)*) };
    (debug, $fmt:literal $(, $arg:expr)*) => { log::debug!($fmt $(, $arg)*) };
    (info,  $fmt:literal $(, $arg:expr)*) => { log::info!($fmt $(, $arg)*) };
    (warn,  $fmt:literal $(, $arg:expr)*) => { log::warn!($fmt $(, $arg)*) };
    (error, $fmt:literal $(, $arg:expr)*) => { log::error!($fmt $(, $arg)*) };
}

#[cfg(not(any(feature = "log", feature = "defmt-logging")))]
macro_rules! nut_log {
    ($level:ident, $fmt:literal $(, $arg:expr)*) => {{
        let _ = $fmt;
        $( let _ = &$arg; )*
    }};
}

macro_rules! nut_trace {
    ($fmt:literal $(, $arg:expr)* $(,)?) => (nut_log!(trace, $fmt $(, $arg)*));
}

macro_rules! nut_debug {
    ($fmt:literal $(, $arg:expr)* $(,)?) => (nut_log!(debug, $fmt $(, $arg)*));
}

macro_rules! nut_info {
    ($fmt:literal $(, $arg:expr)* $(,)?) => (nut_log!(info, $fmt $(, $arg)*));
}

macro_rules! nut_warn {
    ($fmt:literal $(, $arg:expr)* $(,)?) => (nut_log!(warn, $fmt $(, $arg)*));
}

macro_rules! nut_error {
    ($fmt:literal $(, $arg:expr)* $(,)?) => (nut_log!(error, $fmt $(, $arg)*));
}
