use std::{
    env, fs,
    io::{self, Write},
    process,
};

use fiddlec::{error::FiddleError, vm::Vm};

fn repl(vm: &mut Vm) {
    loop {
        print!("> ");
        io::stdout().flush().unwrap();
        let mut line = String::new();
        io::stdin()
            .read_line(&mut line)
            .expect("Unable to read line from the REPL");
        if line.is_empty() {
            break;
        }
        // Diagnostics already went to stderr; the REPL just keeps going
        let _ = vm.interpret(&line);
    }
}

fn run_file(vm: &mut Vm, path: &str) {
    let source = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) => {
            eprintln!("Unable to read file {}: {}", path, error);
            process::exit(74);
        }
    };
    if let Err(error) = vm.interpret(&source) {
        match error {
            FiddleError::Compile => process::exit(65),
            FiddleError::Runtime => process::exit(70),
        }
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let mut vm = Vm::new();
    match args.len() {
        1 => repl(&mut vm),
        2 => run_file(&mut vm, &args[1]),
        _ => {
            eprintln!("Usage: fiddlec [path]");
            process::exit(64);
        }
    }
}
