mod metric;
mod tsig;

pub use metric::{MetricsMiddlewareSvc, Stats};
pub use tsig::TsigMiddlewareSvc;
