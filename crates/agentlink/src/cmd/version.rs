use agentlink_frame::{DEFAULT_CAPACITY, ESC};

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("agentlink {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: agentlink");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("build_target: {}", env!("AGENTLINK_BUILD_TARGET"));
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "rustc: {}",
        option_env!("RUSTC_VERSION").unwrap_or("unknown")
    );
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!("escape_byte: {ESC:#04x}");
    println!("default_capacity: {DEFAULT_CAPACITY}");

    Ok(SUCCESS)
}
