pub mod accrual;
pub mod job_expiry;
