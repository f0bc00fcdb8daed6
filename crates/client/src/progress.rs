//! Download progress reporting.

/// Receives percentage updates while the file streams to disk.
pub trait ProgressUpdater: Send + Sync {
    fn update_progress(&self, percent: u8);
}

/// Prints a progress line to stdout, overwriting in place.
pub struct ConsoleProgress;

impl ProgressUpdater for ConsoleProgress {
    fn update_progress(&self, percent: u8) {
        print!("\rDownloading... {percent:3}%");
        if percent >= 100 {
            println!();
        }
        let _ = std::io::Write::flush(&mut std::io::stdout());
    }
}
