use std::env;
use std::io;

use tracing_subscriber::EnvFilter;

use beeftree::btree::{BTree, SearchResult};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = env::args().skip(1);
    let path = match args.next() {
        Some(path) => path,
        None => {
            eprintln!("beeftree {VERSION}");
            eprintln!("usage: beeftree <database-file> [max-keys-per-node]");
            return;
        }
    };
    let max_keys_per_node: u32 = args
        .next()
        .map(|s| s.parse().expect("max-keys-per-node must be an integer"))
        .unwrap_or(5);

    let mut tree = match BTree::open(&path, max_keys_per_node) {
        Ok(tree) => tree,
        Err(e) => {
            eprintln!("failed to open {path}: {e}");
            std::process::exit(1);
        }
    };

    // A small scripted demonstration: insert a spread of keys, then look a
    // few up, then close cleanly.
    let demo_keys: Vec<i64> = vec![42, 17, 99, 5, 63, 28, 71, 3];
    for &key in &demo_keys {
        tree.insert(key).expect("insert failed");
    }
    println!("inserted {} keys into {path}", demo_keys.len());

    for &key in &[demo_keys[0], 12345] {
        match tree.search(key).expect("search failed") {
            SearchResult::Found { path } => {
                println!("found {key} (descent depth {})", path.len())
            }
            SearchResult::NotFound => println!("{key} not present"),
        }
    }

    tree.close().expect("close failed");
}
