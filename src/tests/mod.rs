#![cfg(test)]

mod engine;
mod support;
