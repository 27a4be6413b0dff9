fn main() {
    if let Err(err) = nppes_loader::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
