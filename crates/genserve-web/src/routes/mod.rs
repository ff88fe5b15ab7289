// Route handler modules

pub mod generate;
pub mod health;
pub mod lora;
pub mod task;
pub mod upload;
