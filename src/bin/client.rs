//! Standalone client binary for the FileVault server
//!
//! Provides a command-line interface for inserting and selecting records

use filevault::Client;
use std::env;
use std::io::{self, Write};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    let server_addr = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| "127.0.0.1:3490".to_string());

    let client = Client::new(server_addr.clone());
    println!("Using FileVault server at {}.", server_addr);
    println!("Type 'help' for available commands or 'quit' to exit.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim_end_matches(['\r', '\n']);

        if input.trim().is_empty() {
            continue;
        }

        match input.trim() {
            "quit" | "exit" => {
                println!("Goodbye!");
                break;
            }
            "help" => {
                print_help();
            }
            _ => {
                if let Err(e) = handle_command(&client, input).await {
                    println!("Error: {}", e);
                }
            }
        }
    }

    Ok(())
}

async fn handle_command(client: &Client, input: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut parts = input.splitn(3, ' ');
    let verb = parts.next().unwrap_or_default();

    match verb.to_ascii_lowercase().as_str() {
        "insert" => {
            let (Some(key), Some(payload)) = (parts.next(), parts.next()) else {
                println!("Usage: insert <key> <payload>");
                return Ok(());
            };

            client.insert(key, payload.as_bytes()).await?;
            println!("OK");
        }
        "select" => {
            let Some(key) = parts.next() else {
                println!("Usage: select <key>");
                return Ok(());
            };

            match client.select(key).await? {
                Some(content) => println!("{}", String::from_utf8_lossy(&content)),
                None => println!("(not found)"),
            }
        }
        "raw" => {
            // Send the rest of the line untouched, for poking at the parser
            let rest = input.splitn(2, ' ').nth(1).unwrap_or_default();
            let response = client.send_raw(format!("{}\n", rest).as_bytes()).await?;
            println!("{:?}", response);
        }
        _ => {
            println!("Unknown command: {}. Type 'help' for available commands.", verb);
        }
    }

    Ok(())
}

fn print_help() {
    println!("Available commands:");
    println!("  insert <key> <payload>  - Create or replace a record");
    println!("  select <key>            - Show a record");
    println!("  raw <line>              - Send a request line as-is");
    println!("  help                    - Show this help message");
    println!("  quit                    - Exit the client");
}
