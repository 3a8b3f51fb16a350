mod client;
mod daemon;
