extern crate env_logger;
extern crate stoker_http;

use std::env;

use stoker_http::server::protocol::Handler;
use stoker_http::server::request::RequestRef;
use stoker_http::server::{ClientId, Context, HttpServer, ServerCore};

struct HelloWorld;

impl Handler for HelloWorld {
    fn on_request_begin(&mut self, core: &mut ServerCore, client: ClientId,
        req: &RequestRef)
    {
        let path = {
            let req = req.request().borrow();
            match req.pool {
                Some(ref pool) => {
                    String::from_utf8_lossy(pool.get(req.path)).into_owned()
                }
                None => String::new(),
            }
        };
        let body = if path == "/" {
            "Hello World!".to_string()
        } else {
            format!("Hello {}!", &path[1..])
        };
        core.write_simple_response(client, 200,
            &[("Content-Type", "text/plain")], body.as_bytes());
        core.end_request(client);
    }
}

fn main() {
    env_logger::init();
    let ctx = Context::new(env::temp_dir()).expect("create context");
    let mut server = HttpServer::new(ctx, HelloWorld);
    let addr = server
        .listen("127.0.0.1:8888".parse().expect("parse address"))
        .expect("bind listen socket");
    println!("listening on http://{}/", addr);
    server.run().expect("event loop");
}
