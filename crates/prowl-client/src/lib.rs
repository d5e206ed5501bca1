pub mod parser;
pub mod transport;

pub use parser::SelectorParser;
pub use transport::ReqwestTransport;
