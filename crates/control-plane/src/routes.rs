pub use crate::http::ApiDoc;
pub use crate::http::build_metrics_router;
pub use crate::http::build_router;
pub use crate::tasks::accrual::{AccrualReport, accrual_loop, run_accrual_cycle, spawn_accrual_worker};
pub use crate::tasks::job_expiry::{job_expiry_loop, run_job_expiry_sweep, spawn_job_expiry_worker};
