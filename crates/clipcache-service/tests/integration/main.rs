mod azure;
mod fetch;
mod service;
mod utils;
