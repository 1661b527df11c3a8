//! RESP command execution against the shared store.

use std::sync::Arc;

use tracing::debug;

use crate::storage::Store;

use super::parser::Frame;

/// Execute one decoded command. Command names are case-insensitive.
pub fn execute(args: &[Vec<u8>], store: &Arc<Store>) -> Frame {
    if args.is_empty() {
        return Frame::error("ERR empty command");
    }

    let cmd = String::from_utf8_lossy(&args[0]).to_uppercase();
    debug!(command = %cmd, argc = args.len(), "executing command");

    match cmd.as_str() {
        "PING" => match args.len() {
            1 => Frame::simple("PONG"),
            2 => Frame::bulk(args[1].clone()),
            _ => Frame::error("ERR wrong number of arguments for 'ping' command"),
        },

        "SET" => {
            if args.len() != 3 {
                return Frame::error("ERR wrong number of arguments for 'set' command");
            }
            store.set(&String::from_utf8_lossy(&args[1]), args[2].clone());
            Frame::simple("OK")
        }

        "GET" => {
            if args.len() != 2 {
                return Frame::error("ERR wrong number of arguments for 'get' command");
            }
            match store.get(&String::from_utf8_lossy(&args[1])) {
                Some(value) => Frame::bulk(value),
                None => Frame::null(),
            }
        }

        "DEL" => {
            if args.len() < 2 {
                return Frame::error("ERR wrong number of arguments for 'del' command");
            }
            let mut deleted = 0i64;
            for key in &args[1..] {
                if store.delete(&String::from_utf8_lossy(key)) {
                    deleted += 1;
                }
            }
            Frame::integer(deleted)
        }

        "KEYS" => {
            if args.len() != 2 {
                return Frame::error("ERR wrong number of arguments for 'keys' command");
            }
            // The pattern argument is accepted but not matched against.
            let keys = store.keys();
            Frame::array(keys.into_iter().map(|k| Frame::bulk(k.into_bytes())).collect())
        }

        "COMMAND" => Frame::array(Vec::new()),

        _ => Frame::error(format!("ERR unknown command '{cmd}'")),
    }
}
