pub mod matching;
pub mod resolver;
