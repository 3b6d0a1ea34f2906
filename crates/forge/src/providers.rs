pub mod anthropic;
pub mod base;
pub mod configs;
pub mod factory;
pub mod oauth;
pub mod ollama;
pub mod openai;
pub mod stream;
pub mod utils;

#[cfg(test)]
pub mod mock;
