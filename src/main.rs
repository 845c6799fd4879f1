use std::process::ExitCode;

fn main() -> ExitCode {
    match replaybuf_lib::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("replaybuf: {}", e);
            ExitCode::FAILURE
        }
    }
}
