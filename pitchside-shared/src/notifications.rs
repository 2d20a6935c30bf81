/// Transactional email
///
/// Templates are rendered to subject and HTML when enqueued, stored in the outbox,
/// and delivered by [`process_outbox`]. Callers treat enqueue failures as non-fatal:
/// a member who paid is registered whether or not the receipt goes out.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgExecutor, PgPool};

use crate::integrations::email::{EmailMessage, EmailSender};
use crate::models::email::{EmailOutbox, EmailStatus};
use crate::models::user::User;
use crate::pricing::format_cents;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailTemplate {
    RegistrationConfirmed {
        registration_name: String,
        amount_cents: i64,
    },
    MembershipConfirmed {
        membership_name: String,
        amount_cents: i64,
        /// Installments still to be charged, when paying by plan
        remaining_installments: Option<i32>,
    },
    WaitlistOffer {
        registration_name: String,
        expires_at: DateTime<Utc>,
    },
    AlternateCharged {
        registration_name: String,
        game_starts_at: DateTime<Utc>,
        location: Option<String>,
        amount_cents: i64,
    },
    PaymentFailed {
        description: String,
        reason: String,
    },
    InstallmentCharged {
        membership_name: String,
        installment_number: i32,
        installments_total: i32,
        amount_cents: i64,
    },
    PaymentPlanFailed {
        membership_name: String,
    },
}

/// Subject and body ready for the outbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

/// Escapes text for inclusion in HTML
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn money(cents: i64) -> String {
    format!("${}", format_cents(cents))
}

fn when(at: &DateTime<Utc>) -> String {
    at.format("%A %B %-d, %Y at %H:%M UTC").to_string()
}

fn layout(first_name: &str, paragraphs: &[String]) -> String {
    let mut html = format!("<p>Hi {},</p>\n", escape_html(first_name));
    for p in paragraphs {
        html.push_str("<p>");
        html.push_str(p);
        html.push_str("</p>\n");
    }
    html.push_str("<p>See you on the pitch.</p>\n");
    html
}

impl EmailTemplate {
    /// Template name stored with the outbox row
    pub fn name(&self) -> &'static str {
        match self {
            EmailTemplate::RegistrationConfirmed { .. } => "registration_confirmed",
            EmailTemplate::MembershipConfirmed { .. } => "membership_confirmed",
            EmailTemplate::WaitlistOffer { .. } => "waitlist_offer",
            EmailTemplate::AlternateCharged { .. } => "alternate_charged",
            EmailTemplate::PaymentFailed { .. } => "payment_failed",
            EmailTemplate::InstallmentCharged { .. } => "installment_charged",
            EmailTemplate::PaymentPlanFailed { .. } => "payment_plan_failed",
        }
    }

    /// Renders for one recipient; every user-provided value is escaped
    pub fn render(&self, first_name: &str) -> RenderedEmail {
        match self {
            EmailTemplate::RegistrationConfirmed {
                registration_name,
                amount_cents,
            } => RenderedEmail {
                subject: format!("You're registered for {}", registration_name),
                html: layout(
                    first_name,
                    &[
                        format!("Your spot in <strong>{}</strong> is confirmed.", escape_html(registration_name)),
                        format!("Amount paid: {}", money(*amount_cents)),
                    ],
                ),
            },
            EmailTemplate::MembershipConfirmed {
                membership_name,
                amount_cents,
                remaining_installments,
            } => {
                let mut paragraphs = vec![
                    format!("Welcome! Your <strong>{}</strong> membership is active.", escape_html(membership_name)),
                    format!("Amount paid: {}", money(*amount_cents)),
                ];
                if let Some(remaining) = remaining_installments.filter(|r| *r > 0) {
                    paragraphs.push(format!(
                        "The remaining {} installment(s) will be charged to your saved card every 30 days.",
                        remaining
                    ));
                }
                RenderedEmail {
                    subject: format!("Your {} membership", membership_name),
                    html: layout(first_name, &paragraphs),
                }
            }
            EmailTemplate::WaitlistOffer {
                registration_name,
                expires_at,
            } => RenderedEmail {
                subject: format!("A spot opened up in {}", registration_name),
                html: layout(
                    first_name,
                    &[
                        format!("A spot in <strong>{}</strong> is being held for you.", escape_html(registration_name)),
                        format!("Complete your registration before {} to keep it.", when(expires_at)),
                    ],
                ),
            },
            EmailTemplate::AlternateCharged {
                registration_name,
                game_starts_at,
                location,
                amount_cents,
            } => {
                let venue = location
                    .as_deref()
                    .map(|l| format!(" at {}", escape_html(l)))
                    .unwrap_or_default();
                RenderedEmail {
                    subject: format!("You're playing: {}", registration_name),
                    html: layout(
                        first_name,
                        &[
                            format!(
                                "You've been picked as an alternate for <strong>{}</strong> on {}{}.",
                                escape_html(registration_name),
                                when(game_starts_at),
                                venue
                            ),
                            format!("Your saved card was charged {}.", money(*amount_cents)),
                        ],
                    ),
                }
            }
            EmailTemplate::PaymentFailed { description, reason } => RenderedEmail {
                subject: "Your payment didn't go through".to_string(),
                html: layout(
                    first_name,
                    &[
                        format!("We couldn't complete your payment for <strong>{}</strong>.", escape_html(description)),
                        format!("Reason: {}", escape_html(reason)),
                        "No money was taken. You can try again from your account.".to_string(),
                    ],
                ),
            },
            EmailTemplate::InstallmentCharged {
                membership_name,
                installment_number,
                installments_total,
                amount_cents,
            } => RenderedEmail {
                subject: format!("Installment {} of {} received", installment_number, installments_total),
                html: layout(
                    first_name,
                    &[format!(
                        "We charged {} for installment {} of {} of your <strong>{}</strong> membership.",
                        money(*amount_cents),
                        installment_number,
                        installments_total,
                        escape_html(membership_name)
                    )],
                ),
            },
            EmailTemplate::PaymentPlanFailed { membership_name } => RenderedEmail {
                subject: "Action needed: your payment plan".to_string(),
                html: layout(
                    first_name,
                    &[
                        format!(
                            "We couldn't charge your card for your <strong>{}</strong> membership after several tries.",
                            escape_html(membership_name)
                        ),
                        "Please contact the club to settle the remaining balance.".to_string(),
                    ],
                ),
            },
        }
    }
}

/// Renders `template` for `user` and writes it to the outbox
pub async fn enqueue<'e, E>(executor: E, user: &User, template: &EmailTemplate) -> Result<EmailOutbox, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let rendered = template.render(&user.first_name);
    EmailOutbox::enqueue(
        executor,
        Some(user.id),
        &user.email,
        template.name(),
        &rendered.subject,
        &rendered.html,
    )
    .await
}

/// [`enqueue`], logging instead of failing
pub async fn enqueue_logged(pool: &PgPool, user: &User, template: &EmailTemplate) {
    if let Err(e) = enqueue(pool, user, template).await {
        tracing::warn!(
            user_id = %user.id,
            template = template.name(),
            error = %e,
            "Failed to enqueue email"
        );
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxReport {
    pub sent: usize,
    pub retrying: usize,
    pub failed: usize,
}

/// Sends due outbox rows
///
/// Each failure schedules a retry with doubling delay; the fifth marks the email
/// `failed`.
pub async fn process_outbox(
    pool: &PgPool,
    sender: &dyn EmailSender,
    batch_size: i64,
    now: DateTime<Utc>,
) -> Result<OutboxReport, sqlx::Error> {
    let mut report = OutboxReport::default();
    let due = EmailOutbox::claim_due(pool, now, batch_size).await?;

    for email in due {
        let message = EmailMessage {
            to: email.to_email.clone(),
            subject: email.subject.clone(),
            html: email.html_body.clone(),
        };

        match sender.send(&message).await {
            Ok(provider_id) => {
                EmailOutbox::mark_sent(pool, email.id, &provider_id, now).await?;
                tracing::debug!(email_id = %email.id, template = %email.template, "Email sent");
                report.sent += 1;
            }
            Err(e) => {
                let status = EmailOutbox::record_failure(pool, &email, &e.to_string(), now).await?;
                if status == EmailStatus::Failed {
                    tracing::error!(
                        email_id = %email.id,
                        template = %email.template,
                        error = %e,
                        "Email permanently failed"
                    );
                    report.failed += 1;
                } else {
                    tracing::warn!(email_id = %email.id, error = %e, "Email send failed, will retry");
                    report.retrying += 1;
                }
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<script>alert("x")</script> & 'y'"#),
            "&lt;script&gt;alert(&quot;x&quot;)&lt;/script&gt; &amp; &#39;y&#39;"
        );
        assert_eq!(escape_html("plain"), "plain");
    }

    #[test]
    fn test_registration_confirmed_escapes_names() {
        let template = EmailTemplate::RegistrationConfirmed {
            registration_name: "<b>Tuesday</b> League".to_string(),
            amount_cents: 9_500,
        };

        let rendered = template.render("Sam <img>");
        assert!(rendered.html.contains("&lt;b&gt;Tuesday&lt;/b&gt; League"));
        assert!(rendered.html.contains("Hi Sam &lt;img&gt;,"));
        assert!(rendered.html.contains("$95.00"));
        assert!(!rendered.html.contains("<img>"));
    }

    #[test]
    fn test_membership_confirmed_mentions_remaining_installments() {
        let with_plan = EmailTemplate::MembershipConfirmed {
            membership_name: "Adult".to_string(),
            amount_cents: 5_000,
            remaining_installments: Some(2),
        }
        .render("Sam");
        assert!(with_plan.html.contains("remaining 2 installment(s)"));

        let paid_in_full = EmailTemplate::MembershipConfirmed {
            membership_name: "Adult".to_string(),
            amount_cents: 15_000,
            remaining_installments: None,
        }
        .render("Sam");
        assert!(!paid_in_full.html.contains("installment"));
    }

    #[test]
    fn test_waitlist_offer_shows_deadline() {
        let expires = Utc.with_ymd_and_hms(2026, 4, 3, 18, 30, 0).unwrap();
        let rendered = EmailTemplate::WaitlistOffer {
            registration_name: "Spring Cup".to_string(),
            expires_at: expires,
        }
        .render("Alex");

        assert_eq!(rendered.subject, "A spot opened up in Spring Cup");
        assert!(rendered.html.contains("Friday April 3, 2026 at 18:30 UTC"));
    }

    #[test]
    fn test_template_names_are_unique() {
        let now = Utc::now();
        let templates = [
            EmailTemplate::RegistrationConfirmed { registration_name: String::new(), amount_cents: 0 },
            EmailTemplate::MembershipConfirmed {
                membership_name: String::new(),
                amount_cents: 0,
                remaining_installments: None,
            },
            EmailTemplate::WaitlistOffer { registration_name: String::new(), expires_at: now },
            EmailTemplate::AlternateCharged {
                registration_name: String::new(),
                game_starts_at: now,
                location: None,
                amount_cents: 0,
            },
            EmailTemplate::PaymentFailed { description: String::new(), reason: String::new() },
            EmailTemplate::InstallmentCharged {
                membership_name: String::new(),
                installment_number: 2,
                installments_total: 3,
                amount_cents: 0,
            },
            EmailTemplate::PaymentPlanFailed { membership_name: String::new() },
        ];

        let mut names: Vec<_> = templates.iter().map(EmailTemplate::name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), templates.len());
    }
}
