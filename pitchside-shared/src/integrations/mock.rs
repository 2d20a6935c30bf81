/// In-memory vendor doubles for tests
///
/// Each mock records what it was asked to do and can be told to fail, so pipeline
/// tests can assert on charges, invoices, emails and alerts without any network.
///
/// ```ignore
/// let mocks = MockIntegrations::new();
/// mocks.payments.decline_charges("insufficient_funds");
/// // ... run a checkout against mocks.integrations.clone()
/// assert_eq!(mocks.alerts.alerts().len(), 0);
/// ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use super::alerts::{AlertSink, CriticalAlert};
use super::email::{EmailError, EmailMessage, EmailSender};
use super::stripe::{
    CreateCustomer, CreatePaymentIntent, CreateSetupIntent, PaymentGateway, PaymentIntent,
    PaymentIntentStatus, SetupIntent, StripeError,
};
use super::xero::{LedgerClient, LedgerError, LedgerInvoice, LedgerPayment};
use super::Integrations;
use crate::config::AccountCodes;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct GatewayState {
    counter: u64,
    customers: Vec<CreateCustomer>,
    intents: HashMap<String, PaymentIntent>,
    idempotency: HashMap<String, String>,
    setup_intents: HashMap<String, SetupIntent>,
    cancelled: Vec<String>,
    decline_code: Option<String>,
    outage: bool,
}

impl GatewayState {
    /// Ids are unique across mocks; several tests share one database
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{}_mock_{}_{}", prefix, self.counter, Uuid::new_v4().simple())
    }
}

/// Stripe double
///
/// Confirmed intents succeed immediately unless [`decline_charges`] was called.
/// Reusing an idempotency key returns the original intent, like Stripe does.
///
/// [`decline_charges`]: MockPaymentGateway::decline_charges
#[derive(Default)]
pub struct MockPaymentGateway {
    state: Mutex<GatewayState>,
}

impl MockPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Confirmed charges fail with this decline code
    pub fn decline_charges(&self, decline_code: &str) {
        lock(&self.state).decline_code = Some(decline_code.to_string());
    }

    pub fn approve_charges(&self) {
        lock(&self.state).decline_code = None;
    }

    /// Every call fails with a transport error
    pub fn set_outage(&self, outage: bool) {
        lock(&self.state).outage = outage;
    }

    /// Simulates the customer completing payment in the browser
    pub fn succeed_intent(&self, id: &str) -> Option<PaymentIntent> {
        let mut state = lock(&self.state);
        let charge_id = state.next_id("ch");
        let payment_method = state.next_id("pm");
        let intent = state.intents.get_mut(id)?;
        intent.status = PaymentIntentStatus::Succeeded;
        intent.latest_charge = Some(charge_id);
        intent.payment_method.get_or_insert(payment_method);
        Some(intent.clone())
    }

    /// Simulates a card failure on a browser-confirmed intent
    pub fn fail_intent(&self, id: &str, decline_code: &str) -> Option<PaymentIntent> {
        let mut state = lock(&self.state);
        let intent = state.intents.get_mut(id)?;
        intent.status = PaymentIntentStatus::RequiresPaymentMethod;
        intent.last_payment_error = Some(super::stripe::LastPaymentError {
            code: Some("card_declined".to_string()),
            decline_code: Some(decline_code.to_string()),
            message: Some("Your card was declined.".to_string()),
        });
        Some(intent.clone())
    }

    /// Simulates the customer saving a card on a SetupIntent
    pub fn complete_setup_intent(&self, id: &str, payment_method: &str) -> Option<SetupIntent> {
        let mut state = lock(&self.state);
        let intent = state.setup_intents.get_mut(id)?;
        intent.status = "succeeded".to_string();
        intent.payment_method = Some(payment_method.to_string());
        Some(intent.clone())
    }

    pub fn intents(&self) -> Vec<PaymentIntent> {
        let mut intents: Vec<_> = lock(&self.state).intents.values().cloned().collect();
        intents.sort_by(|a, b| a.id.cmp(&b.id));
        intents
    }

    pub fn intent(&self, id: &str) -> Option<PaymentIntent> {
        lock(&self.state).intents.get(id).cloned()
    }

    pub fn customer_count(&self) -> usize {
        lock(&self.state).customers.len()
    }

    pub fn cancelled_intents(&self) -> Vec<String> {
        lock(&self.state).cancelled.clone()
    }

    fn check_outage(&self) -> Result<(), StripeError> {
        if lock(&self.state).outage {
            return Err(StripeError::Http("mock outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn create_customer(&self, request: CreateCustomer) -> Result<String, StripeError> {
        self.check_outage()?;
        let mut state = lock(&self.state);
        let id = state.next_id("cus");
        state.customers.push(request);
        Ok(id)
    }

    async fn create_payment_intent(&self, request: CreatePaymentIntent) -> Result<PaymentIntent, StripeError> {
        self.check_outage()?;
        let mut state = lock(&self.state);

        if let Some(existing) = state.idempotency.get(&request.idempotency_key) {
            if let Some(intent) = state.intents.get(existing) {
                return Ok(intent.clone());
            }
        }

        let id = state.next_id("pi");
        let mut intent = PaymentIntent {
            id: id.clone(),
            status: PaymentIntentStatus::RequiresPaymentMethod,
            amount: request.amount_cents,
            currency: request.currency.to_lowercase(),
            client_secret: Some(format!("{}_secret", id)),
            customer: request.customer.clone(),
            payment_method: request.payment_method.clone(),
            latest_charge: None,
            metadata: request.metadata.iter().cloned().collect(),
            last_payment_error: None,
        };

        let declined = state.decline_code.clone();
        if request.confirm {
            match &declined {
                Some(_) => {
                    intent.last_payment_error = Some(super::stripe::LastPaymentError {
                        code: Some("card_declined".to_string()),
                        decline_code: declined.clone(),
                        message: Some("Your card was declined.".to_string()),
                    });
                }
                None => {
                    intent.status = PaymentIntentStatus::Succeeded;
                    intent.latest_charge = Some(state.next_id("ch"));
                }
            }
        }

        state.idempotency.insert(request.idempotency_key.clone(), id.clone());
        state.intents.insert(id, intent.clone());

        match declined {
            Some(decline_code) if request.confirm => Err(StripeError::Api {
                status: 402,
                code: Some("card_declined".to_string()),
                decline_code: Some(decline_code),
                message: "Your card was declined.".to_string(),
            }),
            _ => Ok(intent),
        }
    }

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, StripeError> {
        self.check_outage()?;
        lock(&self.state).intents.get(id).cloned().ok_or_else(|| StripeError::Api {
            status: 404,
            code: Some("resource_missing".to_string()),
            decline_code: None,
            message: format!("No such payment_intent: '{}'", id),
        })
    }

    async fn cancel_payment_intent(&self, id: &str) -> Result<PaymentIntent, StripeError> {
        self.check_outage()?;
        let mut state = lock(&self.state);
        state.cancelled.push(id.to_string());
        let intent = state.intents.get_mut(id).ok_or_else(|| StripeError::Api {
            status: 404,
            code: Some("resource_missing".to_string()),
            decline_code: None,
            message: format!("No such payment_intent: '{}'", id),
        })?;
        intent.status = PaymentIntentStatus::Canceled;
        Ok(intent.clone())
    }

    async fn create_setup_intent(&self, request: CreateSetupIntent) -> Result<SetupIntent, StripeError> {
        self.check_outage()?;
        let mut state = lock(&self.state);

        if let Some(existing) = state.idempotency.get(&request.idempotency_key) {
            if let Some(intent) = state.setup_intents.get(existing) {
                return Ok(intent.clone());
            }
        }

        let id = state.next_id("seti");
        let intent = SetupIntent {
            id: id.clone(),
            status: "requires_payment_method".to_string(),
            client_secret: Some(format!("{}_secret", id)),
            customer: Some(request.customer),
            payment_method: None,
            metadata: request.metadata.into_iter().collect(),
        };
        state.idempotency.insert(request.idempotency_key, id.clone());
        state.setup_intents.insert(id, intent.clone());
        Ok(intent)
    }

    async fn retrieve_setup_intent(&self, id: &str) -> Result<SetupIntent, StripeError> {
        self.check_outage()?;
        lock(&self.state).setup_intents.get(id).cloned().ok_or_else(|| StripeError::Api {
            status: 404,
            code: Some("resource_missing".to_string()),
            decline_code: None,
            message: format!("No such setup_intent: '{}'", id),
        })
    }
}

#[derive(Default)]
struct LedgerState {
    counter: u64,
    contacts: HashMap<String, String>,
    contact_lookups: usize,
    invoices: Vec<(String, LedgerInvoice)>,
    payments: Vec<(String, LedgerPayment)>,
    idempotency: HashMap<String, String>,
    reject_with: Option<String>,
}

/// Xero double
#[derive(Default)]
pub struct MockLedgerClient {
    state: Mutex<LedgerState>,
}

impl MockLedgerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with [`LedgerError::Rejected`] until [`recover`](Self::recover)
    pub fn reject_all(&self, message: &str) {
        lock(&self.state).reject_with = Some(message.to_string());
    }

    pub fn recover(&self) {
        lock(&self.state).reject_with = None;
    }

    /// Invoices created, with their ids
    pub fn invoices(&self) -> Vec<(String, LedgerInvoice)> {
        lock(&self.state).invoices.clone()
    }

    pub fn payments(&self) -> Vec<(String, LedgerPayment)> {
        lock(&self.state).payments.clone()
    }

    pub fn contact_lookups(&self) -> usize {
        lock(&self.state).contact_lookups
    }

    fn check_rejected(state: &LedgerState) -> Result<(), LedgerError> {
        match &state.reject_with {
            Some(message) => Err(LedgerError::Rejected(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LedgerClient for MockLedgerClient {
    async fn find_or_create_contact(&self, _name: &str, email: &str) -> Result<String, LedgerError> {
        let mut state = lock(&self.state);
        Self::check_rejected(&state)?;
        state.contact_lookups += 1;

        if let Some(id) = state.contacts.get(email) {
            return Ok(id.clone());
        }
        state.counter += 1;
        let id = format!("contact-{}", state.counter);
        state.contacts.insert(email.to_string(), id.clone());
        Ok(id)
    }

    async fn create_invoice(&self, invoice: &LedgerInvoice, idempotency_key: &str) -> Result<String, LedgerError> {
        let mut state = lock(&self.state);
        Self::check_rejected(&state)?;

        if let Some(id) = state.idempotency.get(idempotency_key) {
            return Ok(id.clone());
        }
        state.counter += 1;
        let id = format!("invoice-{}", state.counter);
        state.idempotency.insert(idempotency_key.to_string(), id.clone());
        state.invoices.push((id.clone(), invoice.clone()));
        Ok(id)
    }

    async fn create_payment(&self, payment: &LedgerPayment, idempotency_key: &str) -> Result<String, LedgerError> {
        let mut state = lock(&self.state);
        Self::check_rejected(&state)?;

        if let Some(id) = state.idempotency.get(idempotency_key) {
            return Ok(id.clone());
        }
        state.counter += 1;
        let id = format!("payment-{}", state.counter);
        state.idempotency.insert(idempotency_key.to_string(), id.clone());
        state.payments.push((id.clone(), payment.clone()));
        Ok(id)
    }
}

#[derive(Default)]
struct EmailState {
    counter: u64,
    sent: Vec<EmailMessage>,
    failing: bool,
}

/// Email provider double
#[derive(Default)]
pub struct MockEmailSender {
    state: Mutex<EmailState>,
}

impl MockEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        lock(&self.state).failing = failing;
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        lock(&self.state).sent.clone()
    }
}

#[async_trait]
impl EmailSender for MockEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<String, EmailError> {
        let mut state = lock(&self.state);
        if state.failing {
            return Err(EmailError::Provider {
                status: 503,
                message: "mock provider unavailable".to_string(),
            });
        }
        state.counter += 1;
        state.sent.push(message.clone());
        Ok(format!("msg-{}", state.counter))
    }
}

/// Keeps every alert it receives
#[derive(Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<CriticalAlert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<CriticalAlert> {
        lock(&self.alerts).clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn critical(&self, alert: &CriticalAlert) {
        lock(&self.alerts).push(alert.clone());
    }
}

/// An [`Integrations`] bundle wired to mocks, with handles to inspect them
pub struct MockIntegrations {
    pub integrations: Integrations,
    pub payments: Arc<MockPaymentGateway>,
    pub ledger: Arc<MockLedgerClient>,
    pub email: Arc<MockEmailSender>,
    pub alerts: Arc<RecordingAlertSink>,
}

impl MockIntegrations {
    pub fn new() -> Self {
        let payments = Arc::new(MockPaymentGateway::new());
        let ledger = Arc::new(MockLedgerClient::new());
        let email = Arc::new(MockEmailSender::new());
        let alerts = Arc::new(RecordingAlertSink::new());

        let integrations = Integrations {
            payments: payments.clone() as Arc<dyn PaymentGateway>,
            ledger: Some(ledger.clone() as Arc<dyn LedgerClient>),
            email: Some(email.clone() as Arc<dyn EmailSender>),
            alerts: alerts.clone() as Arc<dyn AlertSink>,
            currency: "usd".to_string(),
            accounts: AccountCodes::default(),
        };

        Self {
            integrations,
            payments,
            ledger,
            email,
            alerts,
        }
    }
}

impl Default for MockIntegrations {
    fn default() -> Self {
        Self::new()
    }
}
