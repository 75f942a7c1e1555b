pub mod csv;
pub mod json;
pub mod markdown;
pub mod ranges;
pub mod text;
