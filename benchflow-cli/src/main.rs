//! benchflow binary entry point.

fn main() {
    if let Err(e) = benchflow_cli::run() {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
