pub mod export;
pub mod http_client;
pub mod proxy;
pub mod secrets;
pub mod server;

#[cfg(test)]
mod test_upstream;
