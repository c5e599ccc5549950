use std::time::Duration;

use chrono::NaiveDate;
use tracing::{info, warn};

use super::client::NluService;
use crate::command::model::ParsedCommand;
use crate::command::validator::{self, UNPARSEABLE};

/// Instruction payload sent with every transcript: the four command shapes,
/// one worked example each, and the reference date for relative dates.
pub fn build_instructions(today: NaiveDate) -> String {
    format!(
        r#"Du wandelst Sprachbefehle von Baustellen-Mitarbeitern in genau einen JSON-Befehl um.
Heute ist {today}. Antworte ausschließlich mit JSON, ohne Erklärung.

Erlaubte Befehle:
{{"type": "create_project", "projectInfo": {{"name": str, "address": str, "city": str, "zipCode"?: str, "description"?: str, "isExisting": bool}}, "confidence": number}}
{{"type": "create_task", "taskInfo": {{"projectAddress": str, "description": str, "priority": "low"|"medium"|"high"|"urgent", "category": "work"|"material"|"urgent_material"}}, "confidence": number}}
{{"type": "add_worktime", "worktimeInfo": {{"projectAddress": str, "date": "YYYY-MM-DD", "startTime": "HH:MM", "endTime": "HH:MM", "breakMinutes"?: number, "description": str}}, "confidence": number}}
{{"type": "create_material_order", "taskInfo": {{"projectAddress": str, "description": str}}, "confidence": number}}

Regeln:
- "confidence" liegt zwischen 0 und 1 und beschreibt, wie sicher du dir bist.
- Zeiten im 24-Stunden-Format HH:MM, Datum als YYYY-MM-DD.
- "isExisting" ist nur true, wenn der Sprecher sagt, dass die Baustelle schon existiert.
- "name" enthält die Anrede (Herr, Frau, Familie), wenn genannt.

Beispiele:
"Erstelle Baustelle für Frau Schulz im Lindenweg 4 in Kiel, die ist neu"
{{"type": "create_project", "projectInfo": {{"name": "Frau Schulz", "address": "Lindenweg 4", "city": "Kiel", "isExisting": false}}, "confidence": 0.9}}
"Neue Aufgabe Lindenweg 4: Fenster im Obergeschoss abdichten, hohe Priorität"
{{"type": "create_task", "taskInfo": {{"projectAddress": "Lindenweg 4", "description": "Fenster im Obergeschoss abdichten", "priority": "high", "category": "work"}}, "confidence": 0.85}}
"Arbeitszeit Lindenweg 4 heute von 6:30 bis 15 Uhr, eine halbe Stunde Pause, Estrich verlegt"
{{"type": "add_worktime", "worktimeInfo": {{"projectAddress": "Lindenweg 4", "date": "{today}", "startTime": "06:30", "endTime": "15:00", "breakMinutes": 30, "description": "Estrich verlegt"}}, "confidence": 0.9}}
"Für Lindenweg 4 dringend 20 Sack Zement bestellen"
{{"type": "create_material_order", "taskInfo": {{"projectAddress": "Lindenweg 4", "description": "20 Sack Zement"}}, "confidence": 0.9}}"#,
        today = today.format("%Y-%m-%d"),
    )
}

/// Send a transcript through the NLU service and validate the answer.
///
/// Transport errors and timeouts are treated like an unparseable response:
/// the result is the low-confidence fallback, never an error.
pub async fn parse_transcript(
    service: &dyn NluService,
    transcript: &str,
    timeout: Duration,
    today: NaiveDate,
) -> ParsedCommand {
    if transcript.trim().is_empty() {
        return validator::fallback(
            transcript,
            today,
            vec![UNPARSEABLE.to_string(), "empty transcript".to_string()],
        );
    }

    let instructions = build_instructions(today);
    info!("sending transcript to NLU ({} chars)", transcript.len());

    match tokio::time::timeout(timeout, service.complete(&instructions, transcript)).await {
        Ok(Ok(raw)) => validator::validate(&raw, transcript, today),
        Ok(Err(err)) => {
            warn!("NLU call failed: {err:#}");
            validator::fallback(
                transcript,
                today,
                vec![UNPARSEABLE.to_string(), format!("NLU service error: {err}")],
            )
        }
        Err(_) => {
            warn!("NLU call timed out after {:?}", timeout);
            validator::fallback(
                transcript,
                today,
                vec![
                    UNPARSEABLE.to_string(),
                    format!("NLU service timed out after {}s", timeout.as_secs()),
                ],
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::model::{CommandBody, CommandKind};
    use anyhow::{bail, Result};
    use async_trait::async_trait;

    struct Canned(&'static str);

    #[async_trait]
    impl NluService for Canned {
        async fn complete(&self, instructions: &str, _transcript: &str) -> Result<String> {
            assert!(instructions.contains("create_material_order"));
            Ok(self.0.to_string())
        }
    }

    struct Failing;

    #[async_trait]
    impl NluService for Failing {
        async fn complete(&self, _: &str, _: &str) -> Result<String> {
            bail!("connection refused")
        }
    }

    struct Hanging;

    #[async_trait]
    impl NluService for Hanging {
        async fn complete(&self, _: &str, _: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    #[test]
    fn test_instructions_carry_the_date() {
        let text = build_instructions(today());
        assert!(text.contains("Heute ist 2024-03-15"));
        assert!(text.contains("\"date\": \"2024-03-15\""));
    }

    #[tokio::test]
    async fn test_worksite_transcript_end_to_end() {
        let nlu = Canned(
            r#"{"type":"create_project","projectInfo":{"name":"Herrn Müller","address":"Hauptstraße 10","city":"Hamburg","isExisting":false},"confidence":0.9}"#,
        );
        let cmd = parse_transcript(
            &nlu,
            "Erstelle Baustelle für Herrn Müller in der Hauptstraße 10 in Hamburg, das ist neu",
            Duration::from_secs(5),
            today(),
        )
        .await;
        let CommandBody::CreateWorksite(draft) = &cmd.body else { panic!() };
        assert!(draft.customer_name.contains("Müller"));
        assert_eq!(draft.street, "Hauptstraße 10");
        assert_eq!(draft.city, "Hamburg");
        assert!(!draft.is_existing);
        assert!(cmd.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_garbled_output_degrades() {
        let nlu = Canned("%%% ERR <html>502 Bad Gateway</html>");
        let cmd = parse_transcript(&nlu, "Material für Hauptstraße", Duration::from_secs(5), today()).await;
        assert!(cmd.confidence <= 0.2);
        assert!(!cmd.warnings.is_empty());
        assert_eq!(cmd.kind(), CommandKind::OrderMaterial);
    }

    #[tokio::test]
    async fn test_service_error_degrades() {
        let cmd = parse_transcript(&Failing, "Fenster putzen", Duration::from_secs(5), today()).await;
        assert!(cmd.confidence <= 0.2);
        assert_eq!(cmd.warnings[0], UNPARSEABLE);
        assert!(cmd.warnings[1].contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_degrades() {
        let cmd = parse_transcript(&Hanging, "Fenster putzen", Duration::from_secs(20), today()).await;
        assert!(cmd.confidence <= 0.2);
        assert!(cmd.warnings.iter().any(|w| w.contains("timed out")));
    }

    #[tokio::test]
    async fn test_empty_transcript_skips_the_service() {
        let cmd = parse_transcript(&Failing, "   ", Duration::from_secs(5), today()).await;
        assert_eq!(cmd.kind(), CommandKind::CreateTask);
        assert!(cmd.confidence <= 0.2);
    }
}
