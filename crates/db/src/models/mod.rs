pub mod workflow;
pub mod workflow_step;

#[cfg(test)]
pub(crate) mod test_utils;
