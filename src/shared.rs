pub(crate) mod clock;
pub(crate) mod stream_util;
