pub mod credits;
pub mod nodes;
pub mod tasks;
pub mod tunnel;
pub mod users;

#[cfg(test)]
pub(crate) mod test_support;
