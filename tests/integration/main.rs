mod anvil;
mod common;
mod polling;
mod replay;
