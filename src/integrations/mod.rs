#[cfg(test)]
pub mod mock;
pub mod notion;
pub mod reminders;
