mod resolve;
mod utils;
