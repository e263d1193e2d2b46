//! `chaosentropy config`: print the effective configuration as TOML.

pub fn run(path: Option<&str>) {
    let config = super::load_config(path);
    match config.to_toml() {
        Ok(text) => print!("{text}"),
        Err(e) => {
            eprintln!("Error serializing config: {e}");
            std::process::exit(1);
        }
    }
}
