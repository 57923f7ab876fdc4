#![deny(unsafe_code)]

use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use structopt::StructOpt;

use mqengine::conf::{Options, Settings};
use mqengine::context::EngineContext;
use mqengine::expiring_get::{get_message_with_timeout, CompletionFn, MessageFn};
use mqengine::logger::{config_logger, logger_init};
use mqengine::session::{Destination, Message};
use mqengine::threadjobs::Affinity;
use mqengine::{CallStatus, EngineError, Result};

const RECEIVERS: usize = 4;
const ROUNDS: usize = 50;
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

fn main() {
    //init config
    let settings = Settings::init(Options::from_args()).expect("settings init failed");

    //init log
    let log_cfg = &settings.log;
    logger_init(config_logger(log_cfg.filename(), log_cfg.to, log_cfg.level), log_cfg.level)
        .expect("logger init failed");
    settings.logs();

    //start engine
    let scx = EngineContext::new(settings.clone()).expect("engine start failed");
    let orders = scx.destination("orders", false);

    let producer = {
        let orders = orders.clone();
        thread::Builder::new()
            .name("producer".into())
            .spawn(move || {
                for i in 0..RECEIVERS * ROUNDS / 2 {
                    orders.put(Message::new(format!("order-{i}")));
                    thread::sleep(Duration::from_millis(5));
                }
            })
            .expect("spawn producer failed")
    };

    let receivers = (0..RECEIVERS)
        .map(|n| {
            let (scx, orders) = (scx.clone(), orders.clone());
            thread::Builder::new()
                .name(format!("receiver-{n}"))
                .spawn(move || receive(&scx, &orders, n))
                .expect("spawn receiver failed")
        })
        .collect::<Vec<_>>();

    let (mut received, mut timed_out) = (0, 0);
    for receiver in receivers {
        match receiver.join() {
            Ok(Ok((got, missed))) => {
                received += got;
                timed_out += missed;
            }
            Ok(Err(e)) => log::error!("receiver failed, {}", e),
            Err(e) => log::error!("receiver panicked, {:?}", e),
        }
    }
    if producer.join().is_err() {
        log::error!("producer panicked");
    }

    log::info!("received: {}, timed out: {}, left queued: {}", received, timed_out, orders.queued());
    log::info!("{}", serde_json::to_string_pretty(&scx.stats_json()).unwrap_or_default());
    scx.shutdown();
}

fn receive(scx: &EngineContext, orders: &Arc<Destination>, n: usize) -> Result<(usize, usize)> {
    let name = format!("receiver-{n}");
    let td = scx.register_thread(&name, Affinity::Stealable)?;
    let client = scx.create_client(&name);
    let session = client.create_session()?;

    let (mut got, mut missed) = (0, 0);
    for _ in 0..ROUNDS {
        let (tx, rx) = mpsc::channel();
        let on_message: MessageFn = {
            let name = name.clone();
            Box::new(move |msg| log::debug!("{} got {:?}", name, msg.payload))
        };
        let on_complete: CompletionFn = Box::new(move |rc| {
            let _ = tx.send(rc);
        });

        let rc = match get_message_with_timeout(scx, &session, orders, RECEIVE_TIMEOUT, on_message, on_complete) {
            Ok(CallStatus::Completed) => Ok(()),
            Ok(CallStatus::AsyncCompletion) => {
                td.set_idle(true);
                let rc = rx.recv().unwrap_or(Err(EngineError::Destroyed));
                td.set_idle(false);
                rc
            }
            Err(e) => Err(e),
        };
        match rc {
            Ok(()) => got += 1,
            Err(e) if e.is_flow_control() => missed += 1,
            Err(e) => {
                log::warn!("{} stopped receiving, {}", name, e);
                break;
            }
        }
        scx.thread_jobs.scavenge();
    }

    client.destroy(Box::new(|_| {}))?;
    scx.thread_jobs.deregister();
    Ok((got, missed))
}
