//! Message composition for first contact, reminders and fallback replies.

use crate::channels::Channel;
use crate::clients::Client;
use crate::pipeline::intent::Intent;

/// A composed message. `subject` is set only for email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub subject: Option<String>,
    pub body: String,
}

/// Builds the texts the engine sends on its own initiative.
#[derive(Debug, Clone)]
pub struct Composer {
    sender_name: String,
    demo_link: Option<String>,
}

impl Composer {
    pub fn new(sender_name: impl Into<String>, demo_link: Option<String>) -> Self {
        Self {
            sender_name: sender_name.into(),
            demo_link,
        }
    }

    /// First-contact message for a `NEW` client on its bound channel.
    pub fn first_contact(&self, client: &Client) -> Draft {
        let products = client.products.join(", ");
        let greeting = greeting(&client.name);
        match client.channel() {
            Channel::Email => Draft {
                subject: Some(format!("{products} for {}", client.company)),
                body: format!(
                    "{greeting}\n\n\
                     We help companies like {} with {products}. \
                     Would you be open to a short call, a demo or our presentation?\n\n\
                     Just reply to this email and tell us what suits you.\n\n\
                     Best regards,\n{}",
                    client.company, self.sender_name
                ),
            },
            Channel::Chat => Draft {
                subject: None,
                body: format!(
                    "{greeting} This is {}. We help {} with {products}. \
                     Would you like a demo or our presentation?",
                    self.sender_name, client.company
                ),
            },
        }
    }

    /// Reminder for a client whose requested pause has elapsed.
    pub fn reminder(&self, client: &Client) -> Draft {
        let greeting = greeting(&client.name);
        match client.channel() {
            Channel::Email => Draft {
                subject: Some(format!("Following up: {}", client.company)),
                body: format!(
                    "{greeting}\n\n\
                     You asked us to get back to you about {} around now. \
                     Is this a better time to talk?\n\n\
                     Best regards,\n{}",
                    client.products.join(", "),
                    self.sender_name
                ),
            },
            Channel::Chat => Draft {
                subject: None,
                body: format!(
                    "{greeting} You asked us to come back later, so here we are. \
                     Is now a good time to talk about {}?",
                    client.products.join(", ")
                ),
            },
        }
    }

    /// Reply body used when the classifier produced no text.
    ///
    /// `None` for intents that never reply.
    pub fn fallback_reply(&self, intent: Intent, client: &Client) -> Option<String> {
        let greeting = greeting(&client.name);
        let text = match intent {
            Intent::DemoRequest => match &self.demo_link {
                Some(link) => format!("{greeting} Here is your demo access: {link}"),
                None => format!("{greeting} We will set up a demo for you and send the details shortly."),
            },
            Intent::PresentationRequest => {
                format!("{greeting} Please find our presentation attached.")
            }
            Intent::MoreInfoRequest => {
                format!("{greeting} Thank you for your interest. Here is more information about our offer.")
            }
            Intent::RedirectRequest => {
                format!("{greeting} Thank you, we will contact the right person.")
            }
            Intent::DoNotDisturb | Intent::TimeoutRequest | Intent::Unknown => return None,
        };
        Some(text)
    }

    /// Subject of a reply to an inbound email.
    pub fn reply_subject(&self, inbound_subject: Option<&str>) -> String {
        match inbound_subject.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) if s.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("re:")) => s.to_string(),
            Some(s) => format!("Re: {s}"),
            None => format!("Re: message from {}", self.sender_name),
        }
    }
}

fn greeting(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        "Hello!".to_string()
    } else {
        format!("Hello, {name}!")
    }
}
