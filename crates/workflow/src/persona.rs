//! Agent personas available to a workflow.
//!
//! The set is closed: every persona has one row in [`PERSONAS`] carrying its
//! display name, default task, system prompt and report heading.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use ts_rs::TS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "kebab-case")]
pub enum AgentPersona {
    Analyst,
    Trader,
    Advisor,
    RiskManager,
    Economist,
    General,
}

/// Static description of a persona
#[derive(Debug)]
pub struct PersonaProfile {
    pub persona: AgentPersona,
    pub id: &'static str,
    pub display_name: &'static str,
    /// Task template; `{message}` and `{symbols}` are substituted on dispatch
    pub default_task: &'static str,
    pub system_prompt: &'static str,
    pub report_heading: &'static str,
}

pub const PERSONAS: [PersonaProfile; 6] = [
    PersonaProfile {
        persona: AgentPersona::Analyst,
        id: "analyst",
        display_name: "Market Analyst",
        default_task: "Analyze fundamentals, technicals and recent news for {symbols}. Request: {message}",
        system_prompt: "You are a senior equity market analyst. Ground every claim in fundamentals, price action or news, and state your confidence.",
        report_heading: "Market Analysis",
    },
    PersonaProfile {
        persona: AgentPersona::Trader,
        id: "trader",
        display_name: "Trader",
        default_task: "Propose entry, exit and position sizing for {symbols} based on the analysis so far. Request: {message}",
        system_prompt: "You are a disciplined trader. Produce concrete levels, sizing and invalidation points, never guarantees.",
        report_heading: "Trading Plan",
    },
    PersonaProfile {
        persona: AgentPersona::Advisor,
        id: "advisor",
        display_name: "Financial Advisor",
        default_task: "Explain how {symbols} fit the client's goals and risk tolerance. Request: {message}",
        system_prompt: "You are a fiduciary financial advisor. Speak plainly and tailor advice to the stated risk tolerance and timeframe.",
        report_heading: "Advisor Notes",
    },
    PersonaProfile {
        persona: AgentPersona::RiskManager,
        id: "risk-manager",
        display_name: "Risk Manager",
        default_task: "Assess downside scenarios, concentration and volatility risk for {symbols}. Request: {message}",
        system_prompt: "You are a portfolio risk manager. Quantify exposures and list the scenarios that would break the thesis.",
        report_heading: "Risk Assessment",
    },
    PersonaProfile {
        persona: AgentPersona::Economist,
        id: "economist",
        display_name: "Economist",
        default_task: "Describe the macroeconomic backdrop relevant to {symbols}. Request: {message}",
        system_prompt: "You are a macro economist. Connect rates, inflation, growth and policy to the instruments in question.",
        report_heading: "Macro Outlook",
    },
    PersonaProfile {
        persona: AgentPersona::General,
        id: "general",
        display_name: "Assistant",
        default_task: "{message}",
        system_prompt: "You are a helpful financial assistant. Answer concisely and say when you are unsure.",
        report_heading: "Summary",
    },
];

impl AgentPersona {
    pub const ALL: [AgentPersona; 6] = [
        AgentPersona::Analyst,
        AgentPersona::Trader,
        AgentPersona::Advisor,
        AgentPersona::RiskManager,
        AgentPersona::Economist,
        AgentPersona::General,
    ];

    pub fn profile(self) -> &'static PersonaProfile {
        // PERSONAS is declared in variant order
        &PERSONAS[self as usize]
    }

    pub fn id(self) -> &'static str {
        self.profile().id
    }

    pub fn display_name(self) -> &'static str {
        self.profile().display_name
    }

    /// Accepts `risk-manager`, `risk_manager`, `riskManager`, `Risk Manager`...
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .flat_map(char::to_lowercase)
            .collect();

        match normalized.as_str() {
            "analyst" => Some(AgentPersona::Analyst),
            "trader" => Some(AgentPersona::Trader),
            "advisor" | "adviser" => Some(AgentPersona::Advisor),
            "riskmanager" => Some(AgentPersona::RiskManager),
            "economist" => Some(AgentPersona::Economist),
            "general" | "assistant" => Some(AgentPersona::General),
            _ => None,
        }
    }

    /// Task text used when the caller did not provide one.
    pub fn describe_task(self, message: &str, symbols: &[String]) -> String {
        let symbols = if symbols.is_empty() {
            "the requested instruments".to_string()
        } else {
            symbols.join(", ")
        };

        self.profile()
            .default_task
            .replace("{symbols}", &symbols)
            .replace("{message}", message.trim())
    }
}

impl fmt::Display for AgentPersona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown agent persona: {0}")]
pub struct UnknownPersona(pub String);

impl FromStr for AgentPersona {
    type Err = UnknownPersona;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentPersona::parse(s).ok_or_else(|| UnknownPersona(s.to_string()))
    }
}

/// Serializable view of a persona row
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct PersonaInfo {
    pub id: AgentPersona,
    pub display_name: String,
    pub default_task: String,
    pub report_heading: String,
}

impl From<&PersonaProfile> for PersonaInfo {
    fn from(profile: &PersonaProfile) -> Self {
        Self {
            id: profile.persona,
            display_name: profile.display_name.to_string(),
            default_task: profile.default_task.to_string(),
            report_heading: profile.report_heading.to_string(),
        }
    }
}

pub fn persona_catalog() -> Vec<PersonaInfo> {
    PERSONAS.iter().map(PersonaInfo::from).collect()
}
