//! The `tallyset lookup` command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use comfy_table::{Cell, Table};

use tallyset_core::model::TestTakerId;
use tallyset_sources::config::{create_jotform_client, load_config_from};
use tallyset_sources::jotform::load_question_map;

pub async fn execute(id: String, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config_from(config_path.as_deref())?;
    let client = create_jotform_client(&config)?;
    let prefix = config.aggregate.identity_prefix.as_str();
    let wanted = TestTakerId::normalize(&id, prefix)
        .ok_or_else(|| anyhow::anyhow!("invalid test-taker id: '{id}'"))?;

    let field = &config.aggregate.identity_field;
    let questions = if config.files.question_map.exists() {
        load_question_map(&config.files.question_map)?
    } else {
        client.fetch_questions().await?
    };
    let qid = questions.get(field).with_context(|| {
        format!("identity field '{field}' not found in JotForm questions; run `tallyset questions` to refresh")
    })?;

    let submissions = client
        .find_submissions(qid, id.trim(), |candidate| {
            TestTakerId::normalize(candidate, prefix).as_ref() == Some(&wanted)
        })
        .await?;

    if !submissions.is_empty() {
        let mut table = Table::new();
        table.set_header(vec!["Submission", "Created", "Answers"]);
        for submission in &submissions {
            table.add_row(vec![
                Cell::new(&submission.id),
                Cell::new(submission.created_at.format("%Y-%m-%d %H:%M:%S UTC")),
                Cell::new(submission.answers.len()),
            ]);
        }
        println!("{table}");
    }
    println!("\n{} submission(s) for {wanted}", submissions.len());
    Ok(())
}
