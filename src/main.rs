use ese::EseError;

fn main() {
    if let Err(e) = ese::cli::run() {
        match e.downcast_ref::<EseError>() {
            Some(ese_error) => log::error!("{:?} error: {e:#}", ese_error.kind()),
            None => log::error!("{e:#}"),
        }
        log::logger().flush();
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
