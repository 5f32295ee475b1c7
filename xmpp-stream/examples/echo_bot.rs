use std::env::args;
use std::ops::ControlFlow;
use std::process::exit;
use std::str::FromStr;

use xmpp_stream::config::{BoshConfig, Endpoint};
use xmpp_stream::jid::Jid;
use xmpp_stream::negotiation::StaticPassword;
use xmpp_stream::node::{stanza, Node};
use xmpp_stream::session::{Matcher, Priority, StanzaContext};
use xmpp_stream::{Connection, ConnectionConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = args().collect();
    if args.len() != 3 && args.len() != 4 {
        println!("Usage: {} <jid> <password> [bosh-url]", args[0]);
        exit(1);
    }
    let jid = Jid::from_str(&args[1]).expect(&format!("Invalid JID: {}", &args[1]));
    let password = args[2].to_owned();

    let mut config = ConnectionConfig::new(jid);
    if let Some(url) = args.get(3) {
        config = config.with_endpoint(Endpoint::Bosh(BoshConfig::new(url.as_str())));
    }

    let (mut connection, handle) = Connection::new(config, Box::new(StaticPassword(password)));
    connection.register_handler(
        "",
        "message",
        Matcher::Any,
        Priority::Normal,
        |ctx: &mut StanzaContext<'_>, message: &Node| {
            if message.stanza_type() == Some("error") {
                return ControlFlow::Continue(());
            }
            let body = message.get_child("body", message.ns());
            let (Some(from), Some(body)) = (message.attr("from"), body) else {
                return ControlFlow::Continue(());
            };
            let body = body.text();
            if body == "die" {
                println!("Secret die command triggered by {}", from);
                ctx.close();
            } else {
                // This is a message we'll echo
                let reply = stanza::message(from, message.stanza_type(), Some(&body));
                ctx.send(reply).unwrap();
            }
            ControlFlow::Break(())
        },
    );
    connection.on_disconnect(|reason| println!("Disconnected: {} ({})", reason, reason.subcode()));

    let driver = tokio::spawn(connection.run());

    match handle.wait_established().await {
        Ok(jid) => {
            println!("Online at {}", jid);
            handle.send(make_presence()).unwrap();
        }
        Err(reason) => {
            println!("Could not connect: {}", reason);
            exit(1);
        }
    }

    // the handle keeps the connection open until the bot is told to die
    driver.await.unwrap();
}

// Construct a <presence/>
fn make_presence() -> Node {
    let mut presence = stanza::presence(None, None);
    presence.append_child(Node::builder("show", "").append_text("chat").build());
    presence.append_child(
        Node::builder("status", "")
            .attr("xml:lang", "en")
            .append_text("Echoing messages.")
            .build(),
    );
    presence
}
