pub(crate) mod forward;
pub(crate) mod handler;
pub(crate) mod tunnel;
