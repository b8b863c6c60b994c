use std::error::Error;

use spiral_sfr::utils::io::{CovarianceStore, DiskDB, FileStore};

/// Lists the covariance matrices in a cache and checks each one.
///
/// Usage: inspect <cache path> [rocksdb|files]
fn main() -> Result<(), Box<dyn Error>> {
    let mut args = std::env::args().skip(1);
    let path = args.next().ok_or("usage: inspect <cache path> [rocksdb|files]")?;
    let backend = args.next().unwrap_or_else(|| "rocksdb".to_string());

    let store: Box<dyn CovarianceStore> = match backend.as_str() {
        "rocksdb" => Box::new(DiskDB::connect(&path)?),
        "files" => Box::new(FileStore::new(&path)?),
        other => return Err(format!("unknown backend {other}").into()),
    };

    let keys = store.keys()?;
    for key in &keys {
        match store.load(key)? {
            Some(matrix) => println!(
                "{key}: {0}x{0}, {1} entries, trace {2:.4e}, symmetric: {3}",
                matrix.dim(),
                matrix.nnz(),
                matrix.diagonal().iter().sum::<f64>(),
                matrix.is_symmetric(),
            ),
            None => println!("{key}: vanished while listing"),
        }
    }

    println!("found {} matrices", keys.len());

    Ok(())
}
