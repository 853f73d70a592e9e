pub mod budget;
pub mod caller;
pub mod consent;
pub mod generate;
pub mod health;
pub mod recipes;
