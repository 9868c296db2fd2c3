// REPL binary for cdb.
//
// Reads SQL from stdin, accumulating lines until the statement list is
// terminated with `;`, then executes each statement against one open
// database and prints the result table.  The first argument is the
// database path; ":memory:" (the default) keeps everything in memory.

use std::io::{BufRead, Write};

use anyhow::Result;

fn main() -> Result<()> {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| String::from(":memory:"));
    let db = cdb::open(path.as_str())?;
    println!("connected to {}", path);

    let stdin = std::io::stdin();
    let mut pending = String::new();
    loop {
        if pending.is_empty() {
            print!("cdb> ");
        } else {
            print!("...> ");
        }
        std::io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }
        if pending.is_empty() && line.trim() == ".exit" {
            break;
        }
        pending.push_str(&line);

        let statements = cdb::tokenize(pending.as_str());
        if statements.is_empty() {
            pending.clear();
            continue;
        }
        if !cdb::is_terminated(&statements) {
            continue;
        }
        for statement in &statements {
            let result = db.execute(statement);
            match &result.error {
                Some(e) => println!("error: {}", e.message()),
                None => cdb::formatting::print_result(&result),
            }
        }
        pending.clear();
    }
    Ok(())
}
