pub mod audit;
pub mod scanner;
pub mod settings;
