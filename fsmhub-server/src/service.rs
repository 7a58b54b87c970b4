//! The service event loop.
//!
//! One task owns the registry and multiplexes inbound bus events, reload
//! requests, administrative requests, the reconciliation deadline, clock
//! ticks and sun events. Pending changes and actions are drained before every wait, so
//! all automaton mutation happens on this loop.

use crate::admin::{
    format_status, resolve_switch, switchable, AdminCommand, ADMIN_ENTITY, HELP, LOG_TAIL,
};
use crate::config::Config;
use crate::context::{short_duration, ChangeContext};
use crate::earth::{next_sun_event, SunEvent};
use crate::error::ServerError;
use crate::functions::{parse_arguments, ActionHost, Effects};
use crate::loader::RuleLoader;
use crate::reconcile::Reconciler;
use crate::script::ScriptRunner;
use crate::timer::TimerManager;
use chrono::{DateTime, Local, Utc};
use fsmhub_bus::{topics, Event, EventStream, Fields, Publisher, Subscriber};
use fsmhub_core::{Registry, Trigger};
use fsmhub_storage::{AuditLog, SnapshotStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

type AdminRequest = (String, oneshot::Sender<String>);

/// Reply to an administrative command.
#[derive(Debug)]
pub enum AdminReply {
    Text(String),
    /// Produced off the loop, e.g. by a script.
    Pending(JoinHandle<String>),
}

impl AdminReply {
    pub async fn into_text(self) -> String {
        match self {
            AdminReply::Text(text) => text,
            AdminReply::Pending(handle) => handle
                .await
                .unwrap_or_else(|e| format!("Command failed: {}", e)),
        }
    }
}

/// Controls a running [`Service`] from other tasks.
#[derive(Clone)]
pub struct ServiceHandle {
    shutdown: broadcast::Sender<()>,
    reload: mpsc::UnboundedSender<()>,
    admin: mpsc::UnboundedSender<AdminRequest>,
}

impl ServiceHandle {
    /// Stops the loop. Outstanding timers are cancelled.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Requests a (debounced) rule reload.
    pub fn reload(&self) {
        let _ = self.reload.send(());
    }

    /// Runs an administrative command on the loop.
    pub async fn admin(&self, line: &str) -> Result<String, ServerError> {
        let (tx, rx) = oneshot::channel();
        self.admin
            .send((line.to_string(), tx))
            .map_err(|_| ServerError::ShuttingDown)?;
        rx.await.map_err(|_| ServerError::ShuttingDown)
    }
}

pub struct Service {
    effects: Effects,
    registry: Registry,
    loader: RuleLoader,
    timers: TimerManager,
    store: SnapshotStore,
    reconciler: Reconciler,
    reconcile_window: Duration,
    reload_debounce: Duration,
    clock_interval: Option<Duration>,
    location: Option<(f64, f64)>,
    last_reload_error: Option<String>,
    started: Instant,

    events: EventStream,
    shutdown: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
    reload_tx: mpsc::UnboundedSender<()>,
    reload_rx: mpsc::UnboundedReceiver<()>,
    admin_tx: mpsc::UnboundedSender<AdminRequest>,
    admin_rx: mpsc::UnboundedReceiver<AdminRequest>,
}

impl Service {
    /// Creates a service, loading the rule document. Failing to compile the
    /// initial rules is fatal since there is nothing to fall back on.
    ///
    /// The bus subscription is taken here, so events published between
    /// construction and [`Service::run`] are not lost.
    pub fn new<B>(config: &Config, bus: Arc<B>) -> Result<Self, ServerError>
    where
        B: Publisher + Subscriber + 'static,
    {
        let devices = Arc::new(config.devices.clone());
        let loader = RuleLoader::new(&config.rules.path, Arc::clone(&devices));
        let rules = loader.load()?;

        let audit = Arc::new(AuditLog::open(config.storage.audit_log_path())?);
        let store = SnapshotStore::open(config.storage.snapshot_path())?;
        let events = bus.subscribe_all();

        let effects = Effects {
            publisher: bus.clone(),
            subscriber: bus.clone(),
            audit,
            scripts: ScriptRunner::new(&config.scripts.dir),
            query_timeout: config.query.timeout(),
            devices,
        };

        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let (reload_tx, reload_rx) = mpsc::unbounded_channel();
        let (admin_tx, admin_rx) = mpsc::unbounded_channel();

        Ok(Self {
            timers: TimerManager::new(bus),
            effects,
            registry: Registry::new(rules),
            loader,
            store,
            reconciler: Reconciler::new(config.reconcile.window()),
            reconcile_window: config.reconcile.window(),
            reload_debounce: config.rules.reload_debounce(),
            clock_interval: config.clock.interval(),
            location: config.earth.location(),
            last_reload_error: None,
            started: Instant::now(),
            events,
            shutdown,
            shutdown_rx,
            reload_tx,
            reload_rx,
            admin_tx,
            admin_rx,
        })
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            shutdown: self.shutdown.clone(),
            reload: self.reload_tx.clone(),
            admin: self.admin_tx.clone(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Runs the loop until shutdown.
    pub async fn run(mut self) -> Result<(), ServerError> {
        self.started = Instant::now();
        self.reconciler = Reconciler::new(self.reconcile_window);
        for id in self.restore_snapshot() {
            self.reconciler.mark(id);
        }

        let mut clock = self.clock_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut reload_deadline: Option<Instant> = None;
        let mut sun = self.next_sun(Utc::now());

        info!(
            "Running {} automata from {} (reconcile window {:?})",
            self.registry.len(),
            self.loader.path().display(),
            self.reconcile_window
        );

        loop {
            self.drain();

            tokio::select! {
                biased;

                _ = self.shutdown_rx.recv() => {
                    info!("Service shutting down");
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!("Bus subscription closed");
                        break;
                    }
                },
                Some(()) = self.reload_rx.recv() => {
                    reload_deadline = Some(Instant::now() + self.reload_debounce);
                }
                Some((line, reply)) = self.admin_rx.recv() => {
                    self.respond(&line, move |text| {
                        let _ = reply.send(text);
                    });
                }
                _ = sleep_until(reload_deadline.unwrap_or_else(Instant::now)), if reload_deadline.is_some() => {
                    reload_deadline = None;
                    self.reload();
                }
                _ = sleep_until(self.reconciler.deadline()), if self.reconciler.is_open() => {
                    self.finish_reconcile();
                }
                _ = next_tick(&mut clock), if clock.is_some() => {
                    self.tick();
                }
                _ = sleep_until(sun.map(|(due, _, _)| due).unwrap_or_else(Instant::now)), if sun.is_some() => {
                    if let Some((_, at, event)) = sun.take() {
                        if let Some(event) = event {
                            self.publish_sun(event);
                        }
                        sun = self.next_sun(at);
                    }
                }
            }
        }

        self.drain();
        self.timers.shutdown();
        Ok(())
    }

    fn restore_snapshot(&mut self) -> Vec<String> {
        match self.store.load() {
            Ok(snapshot) => {
                let restored = self.registry.restore(&snapshot);
                info!(
                    "Restored {} automata from {}",
                    restored.len(),
                    self.store.path().display()
                );
                restored
            }
            Err(e) => {
                warn!("Restoring automata state failed: {}", e);
                Vec::new()
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        if event.retained {
            if !self.reconciler.observe_retained(&mut self.registry, &event) {
                debug!(topic = %event.topic, entity = %event.entity, "ignored retained event");
            }
            return;
        }

        match event.topic.as_str() {
            topics::COMMAND => self.acknowledge(&event),
            topics::CONFIG if event.entity == ADMIN_ENTITY => {
                info!("Rule document changed");
                let _ = self.reload_tx.send(());
            }
            topics::QUERY if event.entity == ADMIN_ENTITY => self.answer_query(&event),
            _ => {
                self.registry.process(Arc::new(event));
            }
        }
    }

    /// Commands are never matched; scenes acknowledge theirs.
    fn acknowledge(&self, event: &Event) {
        if event.kind() != "scene" {
            return;
        }
        let command = event.command_name().unwrap_or("on");
        debug!(scene = %event.entity, command, "acknowledging scene");
        self.effects.publisher.emit(
            Event::new(topics::ACK, event.entity.as_str(), Fields::new())
                .with_field("command", command),
        );
    }

    fn answer_query(&mut self, event: &Event) {
        let line = event.string_field("query").unwrap_or_default().to_string();
        let id = event.string_field("id").unwrap_or_default().to_string();
        let publisher = Arc::clone(&self.effects.publisher);

        self.respond(&line, move |text| {
            publisher.emit(
                Event::new(topics::ANSWER, ADMIN_ENTITY, Fields::new())
                    .with_field("id", id)
                    .with_field("text", text),
            );
        });
    }

    fn respond<F>(&mut self, line: &str, respond: F)
    where
        F: FnOnce(String) + Send + 'static,
    {
        match self.admin(line) {
            AdminReply::Text(text) => respond(text),
            pending => {
                tokio::spawn(async move { respond(pending.into_text().await) });
            }
        }
    }

    /// Publishes pending changes, saves the snapshot once per batch, then
    /// executes pending actions.
    fn drain(&mut self) {
        let mut changed = false;
        while let Some(change) = self.registry.pop_change() {
            self.reconciler.mark(change.automaton.as_str());
            self.publish_state(
                &change.automaton,
                &change.new,
                change.at,
                &change.trigger.to_string(),
            );
            changed = true;
        }
        if changed {
            self.save_snapshot();
        }

        while let Some(scheduled) = self.registry.pop_action() {
            let ctx = ChangeContext::new(&scheduled.change, &self.effects.devices);
            let mut host = ActionHost::new(&self.effects, &self.registry, &mut self.timers);
            if let Err(e) = scheduled.action.execute(&ctx, &mut host) {
                warn!(
                    automaton = %scheduled.automaton,
                    action = scheduled.action.source(),
                    error = %e,
                    "action failed"
                );
            }
        }
    }

    fn publish_state(&self, id: &str, state: &str, since: DateTime<Utc>, trigger: &str) {
        self.effects.publisher.emit(
            Event::new(topics::STATE, id, Fields::new())
                .with_field("state", state)
                .with_field("since", since.to_rfc3339())
                .with_field("trigger", trigger)
                .with_retained(true),
        );
    }

    /// Publishes the current state of automata nobody has confirmed.
    fn publish_initial(&mut self, ids: &[String]) {
        for id in ids {
            if let Some(automaton) = self.registry.get(id) {
                self.publish_state(id, automaton.state_name(), automaton.since(), "initial");
            }
        }
        if !ids.is_empty() {
            self.save_snapshot();
        }
    }

    fn save_snapshot(&self) {
        match self.store.save(&self.registry.persist()) {
            Ok(meta) => debug!(
                automata = meta.automata,
                bytes = meta.size_bytes,
                "snapshot saved"
            ),
            Err(e) => error!("Failed to save snapshot: {}", e),
        }
    }

    fn finish_reconcile(&mut self) {
        let pending = self.reconciler.close(&self.registry);
        info!(
            "Reconciliation finished, {} of {} automata at default state",
            pending.len(),
            self.registry.len()
        );
        self.publish_initial(&pending);
    }

    fn reload(&mut self) {
        match self.loader.load() {
            Ok(rules) => {
                let fresh = self.registry.replace_rules(rules);
                self.last_reload_error = None;
                info!(
                    "Reloaded {} automata (generation {}, {} new)",
                    self.registry.len(),
                    self.registry.generation(),
                    fresh.len()
                );
                // While the window is open, closing it covers new automata.
                if !self.reconciler.is_open() {
                    self.publish_initial(&fresh);
                }
            }
            Err(e) => {
                error!(
                    "Reload failed, keeping generation {}: {}",
                    self.registry.generation(),
                    e
                );
                self.last_reload_error = Some(e.to_string());
            }
        }
    }

    fn tick(&self) {
        let time = Local::now().format("%H%M").to_string();
        self.effects
            .publisher
            .emit(Event::new(topics::CLOCK, "clock", Fields::new()).with_field("time", time));
    }

    /// The next sun event after `after` and the loop deadline it falls due
    /// at. During polar day or night there is no event; check again a day
    /// later.
    fn next_sun(
        &self,
        after: DateTime<Utc>,
    ) -> Option<(Instant, DateTime<Utc>, Option<SunEvent>)> {
        let (latitude, longitude) = self.location?;
        let (at, event) = match next_sun_event(latitude, longitude, after) {
            Some((at, event)) => (at, Some(event)),
            None => {
                debug!(latitude, longitude, "no sun event in the next days");
                (after + chrono::Duration::days(1), None)
            }
        };
        let wait = (at - Utc::now()).to_std().unwrap_or_default();
        Some((Instant::now() + wait, at, event))
    }

    fn publish_sun(&self, event: SunEvent) {
        info!("Sun event: {}", event);
        self.effects.publisher.emit(
            Event::new(topics::EARTH, "earth", Fields::new()).with_field("command", event.as_str()),
        );
    }

    /// Runs an administrative command.
    pub fn admin(&mut self, line: &str) -> AdminReply {
        let command = match AdminCommand::parse(line) {
            Ok(command) => command,
            Err(e) => return AdminReply::Text(e.to_string()),
        };

        match command {
            AdminCommand::Status => AdminReply::Text(self.status()),
            AdminCommand::State { automaton, state } => {
                let text = match self
                    .registry
                    .change_state(&automaton, &state, Trigger::Admin)
                {
                    Ok(()) => format!("Change {} state to {}", automaton, state),
                    Err(e) => e.to_string(),
                };
                AdminReply::Text(text)
            }
            AdminCommand::Logs => AdminReply::Text(match self.effects.audit.tail(LOG_TAIL) {
                Ok(lines) => lines.join("\n"),
                Err(e) => format!("Couldn't retrieve logs: {}", e),
            }),
            AdminCommand::Script(line) => {
                let scripts = self.effects.scripts.clone();
                AdminReply::Pending(tokio::spawn(async move {
                    match scripts.run(&line).await {
                        Ok(output) => output,
                        Err(e) => format!("Script failed: {}", e),
                    }
                }))
            }
            AdminCommand::Switch(args) => AdminReply::Text(self.switch(&args)),
            AdminCommand::Help => AdminReply::Text(HELP.to_string()),
        }
    }

    fn status(&self) -> String {
        let mut out = format_status(&self.registry, &self.effects.devices, Utc::now());
        out.push_str(&format!(
            "generation {}, up {}\n",
            self.registry.generation(),
            short_duration(chrono::Duration::seconds(
                self.started.elapsed().as_secs() as i64
            ))
        ));
        if let Some(e) = &self.last_reload_error {
            out.push_str(&format!("last reload failed: {}\n", e));
        }
        out
    }

    fn switch(&self, args: &[String]) -> String {
        let devices = &self.effects.devices;
        let Some((name, rest)) = args.split_first() else {
            return switchable(devices).join(", ");
        };

        let id = match resolve_switch(devices, name) {
            Ok(id) => id,
            Err(e) => return e.to_string(),
        };
        let (command, fields) = parse_arguments(rest.iter().map(String::as_str));
        self.effects.send_command(id, &command, fields);
        format!("Switched {} {}", devices[id].name, command)
    }
}

async fn next_tick(clock: &mut Option<Interval>) {
    match clock {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
