//! Synthetic shopping sessions for load testing the gateway.
//!
//! Each session belongs to one user on one device and walks a funnel:
//! `login`, one or more `product_view`s, then optionally `add_to_cart`,
//! `checkout` and a `payment_success` or `payment_failure`. Timestamps
//! advance by a few seconds per step so a session reads in order.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value, json};

const CITIES: [&str; 8] = [
    "Lisbon", "Berlin", "Austin", "Osaka", "Nairobi", "Toronto", "Lyon", "Pune",
];
const DEVICES: [&str; 3] = ["desktop", "mobile", "tablet"];
const LOGIN_METHODS: [&str; 3] = ["email_password", "google", "facebook"];
const CATEGORIES: [&str; 4] = ["electronics", "clothing", "books", "home"];
const REFERRERS: [&str; 4] = ["homepage", "search", "email", "ads"];
const SEARCH_TERMS: [&str; 6] = ["lamp", "boots", "novel", "headphones", "kettle", "jacket"];
const PAYMENT_METHODS: [&str; 3] = ["credit_card", "paypal", "apple_pay"];
const FAILURE_REASONS: [&str; 3] = ["insufficient_funds", "invalid_card", "network_error"];
const USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (X11; Linux x86_64)",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X)",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64)",
];

/// Funnel probabilities.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Chance a session adds something to the cart.
    pub cart_rate: f64,

    /// Chance a session with a cart checks out.
    pub checkout_rate: f64,

    /// Chance a checkout's payment succeeds.
    pub payment_success_rate: f64,

    /// Most products viewed per session.
    pub max_views: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            cart_rate: 0.6,
            checkout_rate: 0.7,
            payment_success_rate: 0.85,
            max_views: 4,
        }
    }
}

/// Produces events one at a time, starting a new session when the
/// current one is used up.
pub struct EventGenerator {
    rng: StdRng,
    config: GeneratorConfig,
    pending: VecDeque<Value>,
}

impl EventGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self::with_rng(StdRng::from_os_rng(), config)
    }

    /// Deterministic output for a given seed.
    pub fn seeded(seed: u64, config: GeneratorConfig) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), config)
    }

    fn with_rng(rng: StdRng, config: GeneratorConfig) -> Self {
        Self {
            rng,
            config,
            pending: VecDeque::new(),
        }
    }

    pub fn next_event(&mut self) -> Value {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }
            let session = self.session(Utc::now());
            self.pending.extend(session);
        }
    }

    /// Every event of one new session, in timestamp order.
    pub fn session(&mut self, start: DateTime<Utc>) -> Vec<Value> {
        let session = Session {
            session_id: self.uuid(),
            user_id: self.rng.random_range(1000..=999_999),
            location: self.pick(&CITIES),
            device: self.pick(&DEVICES),
        };
        let mut clock = start;
        let mut events = Vec::new();

        let login = json!({
            "ip_address": format!(
                "{}.{}.{}.{}",
                self.rng.random_range(1..=223),
                self.rng.random::<u8>(),
                self.rng.random::<u8>(),
                self.rng.random_range(1..=254)
            ),
            "login_method": self.pick(&LOGIN_METHODS),
            "user_agent": self.pick(&USER_AGENTS),
            "success": true,
        });
        events.push(self.event(&session, "login", clock, login));

        let views = self.rng.random_range(1..=self.config.max_views.max(1));
        let mut viewed = Vec::with_capacity(views as usize);
        for _ in 0..views {
            clock = self.tick(clock);
            let product_id = self.product_id();
            let fields = json!({
                "product_id": product_id,
                "category": self.pick(&CATEGORIES),
                "search_query": self.pick(&SEARCH_TERMS),
                "referrer": self.pick(&REFERRERS),
                "duration_seconds": self.rng.random_range(10..=300),
            });
            viewed.push(product_id);
            events.push(self.event(&session, "product_view", clock, fields));
        }

        if !self.rng.random_bool(self.config.cart_rate) {
            return events;
        }

        let cart_id = self.uuid();
        let mut total_items = 0u32;
        let mut total_value = 0.0;
        for product_id in &viewed {
            if total_items > 0 && self.rng.random_bool(0.5) {
                continue;
            }
            clock = self.tick(clock);
            let quantity = self.rng.random_range(1..=5u32);
            let price = cents(self.rng.random_range(10.0..500.0));
            total_items += quantity;
            total_value += price * f64::from(quantity);
            let fields = json!({
                "product_id": product_id,
                "quantity": quantity,
                "price": price,
                "cart_id": cart_id,
                "was_wishlist_item": self.rng.random_bool(0.2),
            });
            events.push(self.event(&session, "add_to_cart", clock, fields));
        }

        if !self.rng.random_bool(self.config.checkout_rate) {
            return events;
        }

        clock = self.tick(clock);
        let total_value = cents(total_value);
        let payment_method = self.pick(&PAYMENT_METHODS);
        let checkout = json!({
            "cart_id": cart_id,
            "total_items": total_items,
            "total_value": total_value,
            "shipping_address": {
                "street": format!("{} Market Street", self.rng.random_range(1..=999)),
                "city": session.location,
                "zip": format!("{:05}", self.rng.random_range(1000..=99_999)),
            },
            "payment_method_selected": payment_method,
        });
        events.push(self.event(&session, "checkout", clock, checkout));

        clock = self.tick(clock);
        let mut payment = Map::new();
        payment.insert("order_id".into(), json!(self.uuid()));
        payment.insert("cart_id".into(), json!(cart_id));
        payment.insert("amount".into(), json!(total_value));
        payment.insert("payment_method".into(), json!(payment_method));
        payment.insert("transaction_id".into(), json!(self.uuid()));
        let event_type = if self.rng.random_bool(self.config.payment_success_rate) {
            "payment_success"
        } else {
            payment.insert("failure_reason".into(), json!(self.pick(&FAILURE_REASONS)));
            "payment_failure"
        };
        events.push(self.event(&session, event_type, clock, Value::Object(payment)));

        events
    }

    fn event(&mut self, session: &Session, event_type: &str, at: DateTime<Utc>, fields: Value) -> Value {
        let mut event = json!({
            "event_id": self.uuid(),
            "event_type": event_type,
            "user_id": session.user_id,
            "session_id": session.session_id,
            "timestamp": at.to_rfc3339(),
            "location": session.location,
            "device": session.device,
        });
        if let (Value::Object(event), Value::Object(fields)) = (&mut event, fields) {
            event.extend(fields);
        }
        event
    }

    fn tick(&mut self, clock: DateTime<Utc>) -> DateTime<Utc> {
        clock + Duration::seconds(self.rng.random_range(1..=90))
    }

    fn uuid(&mut self) -> String {
        uuid::Builder::from_random_bytes(self.rng.random()).into_uuid().to_string()
    }

    fn product_id(&mut self) -> String {
        format!("P{}", self.rng.random_range(1000..=9999))
    }

    fn pick(&mut self, values: &[&'static str]) -> &'static str {
        values.choose(&mut self.rng).copied().unwrap_or_default()
    }
}

struct Session {
    session_id: String,
    user_id: u32,
    location: &'static str,
    device: &'static str,
}

fn cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
