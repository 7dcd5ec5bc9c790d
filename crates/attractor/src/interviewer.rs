//! Human-in-the-loop seam: questions derived from graph structure, answers
//! supplied by an injected interviewer.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuestionType {
    YesNo,
    MultipleChoice,
    Freeform,
    Confirmation,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Choice {
    /// Accelerator key, e.g. `Y` for `[Y] Yes`.
    pub key: String,
    pub label: String,
    /// Target node the choice routes to.
    pub target: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Question {
    pub stage: String,
    pub text: String,
    pub question_type: QuestionType,
    pub choices: Vec<Choice>,
    pub default_choice: Option<String>,
    pub timeout: Option<Duration>,
}

impl Question {
    pub fn multiple_choice(stage: impl Into<String>, text: impl Into<String>, choices: Vec<Choice>) -> Self {
        Self {
            stage: stage.into(),
            text: text.into(),
            question_type: QuestionType::MultipleChoice,
            choices,
            default_choice: None,
            timeout: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Answer {
    Selected(String),
    Yes,
    No,
    Text(String),
    Timeout,
    Skipped,
}

/// Extract the accelerator key from label patterns `[K] Label`, `K) Label`,
/// and `K - Label`; falls back to the first character.
pub fn parse_accelerator_key(label: &str) -> String {
    let trimmed = label.trim();
    if let Some(rest) = trimmed.strip_prefix('[') {
        if let Some((key, _)) = rest.split_once(']') {
            if key.chars().count() == 1 {
                return key.to_ascii_uppercase();
            }
        }
    }
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 3 && bytes[0].is_ascii_alphanumeric() && bytes[1] == b')' && bytes[2] == b' '
    {
        return trimmed[..1].to_ascii_uppercase();
    }
    if bytes.len() >= 4
        && bytes[0].is_ascii_alphanumeric()
        && bytes[1] == b' '
        && bytes[2] == b'-'
        && bytes[3] == b' '
    {
        return trimmed[..1].to_ascii_uppercase();
    }
    trimmed
        .chars()
        .next()
        .map(|ch| ch.to_ascii_uppercase().to_string())
        .unwrap_or_default()
}

#[async_trait]
pub trait Interviewer: Send + Sync {
    async fn ask(&self, question: Question) -> Answer;

    async fn ask_multiple(&self, questions: Vec<Question>) -> Vec<Answer> {
        let mut answers = Vec::with_capacity(questions.len());
        for question in questions {
            answers.push(self.ask(question).await);
        }
        answers
    }

    async fn inform(&self, _message: &str, _stage: &str) {}
}

/// Picks the first option (or YES); for CI and unattended runs.
#[derive(Debug, Default)]
pub struct AutoApproveInterviewer;

#[async_trait]
impl Interviewer for AutoApproveInterviewer {
    async fn ask(&self, question: Question) -> Answer {
        match question.question_type {
            QuestionType::YesNo | QuestionType::Confirmation => Answer::Yes,
            QuestionType::MultipleChoice => question
                .choices
                .first()
                .map(|choice| Answer::Selected(choice.key.clone()))
                .unwrap_or(Answer::Skipped),
            QuestionType::Freeform => Answer::Text("auto-approved".to_string()),
        }
    }
}

/// Pops pre-filled answers; empty queue answers `Skipped`. Deterministic
/// testing and scripted runs.
#[derive(Default)]
pub struct QueueInterviewer {
    answers: Mutex<VecDeque<Answer>>,
}

impl QueueInterviewer {
    pub fn new(answers: impl IntoIterator<Item = Answer>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
        }
    }

    pub fn enqueue(&self, answer: Answer) {
        self.answers
            .lock()
            .expect("answer queue mutex should lock")
            .push_back(answer);
    }
}

#[async_trait]
impl Interviewer for QueueInterviewer {
    async fn ask(&self, _question: Question) -> Answer {
        self.answers
            .lock()
            .expect("answer queue mutex should lock")
            .pop_front()
            .unwrap_or(Answer::Skipped)
    }
}

/// Delegates every question to a function.
pub struct CallbackInterviewer {
    callback: Box<dyn Fn(&Question) -> Answer + Send + Sync>,
}

impl CallbackInterviewer {
    pub fn new(callback: impl Fn(&Question) -> Answer + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl Interviewer for CallbackInterviewer {
    async fn ask(&self, question: Question) -> Answer {
        (self.callback)(&question)
    }
}

/// Wraps another interviewer and appends every Q/A pair to a list.
pub struct RecordingInterviewer {
    inner: Arc<dyn Interviewer>,
    recordings: Mutex<Vec<(Question, Answer)>>,
}

impl RecordingInterviewer {
    pub fn new(inner: Arc<dyn Interviewer>) -> Self {
        Self {
            inner,
            recordings: Mutex::new(Vec::new()),
        }
    }

    pub fn recordings(&self) -> Vec<(Question, Answer)> {
        self.recordings
            .lock()
            .expect("recordings mutex should lock")
            .clone()
    }
}

#[async_trait]
impl Interviewer for RecordingInterviewer {
    async fn ask(&self, question: Question) -> Answer {
        let answer = self.inner.ask(question.clone()).await;
        self.recordings
            .lock()
            .expect("recordings mutex should lock")
            .push((question, answer.clone()));
        answer
    }

    async fn inform(&self, message: &str, stage: &str) {
        self.inner.inform(message, stage).await;
    }
}

/// Prompts on the terminal. Blocking reads run on the blocking pool so the
/// engine's task is not starved.
#[derive(Debug, Default)]
pub struct ConsoleInterviewer;

#[async_trait]
impl Interviewer for ConsoleInterviewer {
    async fn ask(&self, question: Question) -> Answer {
        let rendered = render_question(&question);
        let answer = tokio::task::spawn_blocking(move || {
            let mut stdout = io::stdout();
            let _ = stdout.write_all(rendered.as_bytes());
            let _ = stdout.flush();

            let mut line = String::new();
            match io::stdin().lock().read_line(&mut line) {
                Ok(0) | Err(_) => None,
                Ok(_) => Some(line.trim().to_string()),
            }
        })
        .await
        .ok()
        .flatten();

        match answer {
            None => Answer::Skipped,
            Some(text) if text.is_empty() => Answer::Skipped,
            Some(text) => match question.question_type {
                QuestionType::YesNo | QuestionType::Confirmation => {
                    if text.eq_ignore_ascii_case("y") || text.eq_ignore_ascii_case("yes") {
                        Answer::Yes
                    } else {
                        Answer::No
                    }
                }
                QuestionType::Freeform => Answer::Text(text),
                QuestionType::MultipleChoice => Answer::Selected(text),
            },
        }
    }

    async fn inform(&self, message: &str, stage: &str) {
        println!("[{stage}] {message}");
    }
}

fn render_question(question: &Question) -> String {
    let mut out = format!("\n[{}] {}\n", question.stage, question.text);
    for choice in &question.choices {
        out.push_str(&format!("  {}: {}\n", choice.key, choice.label));
    }
    out.push_str("> ");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_question() -> Question {
        Question::multiple_choice(
            "gate",
            "Proceed?",
            vec![
                Choice {
                    key: "Y".to_string(),
                    label: "[Y] Yes".to_string(),
                    target: "yes".to_string(),
                },
                Choice {
                    key: "N".to_string(),
                    label: "[N] No".to_string(),
                    target: "no".to_string(),
                },
            ],
        )
    }

    #[test]
    fn parse_accelerator_key_expected_patterns() {
        assert_eq!(parse_accelerator_key("[Y] Yes"), "Y");
        assert_eq!(parse_accelerator_key("n) No"), "N");
        assert_eq!(parse_accelerator_key("r - Retry"), "R");
        assert_eq!(parse_accelerator_key("Approve"), "A");
        assert_eq!(parse_accelerator_key(""), "");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn auto_approve_expected_first_choice() {
        let answer = AutoApproveInterviewer.ask(sample_question()).await;
        assert_eq!(answer, Answer::Selected("Y".to_string()));

        let mut yes_no = sample_question();
        yes_no.question_type = QuestionType::YesNo;
        assert_eq!(AutoApproveInterviewer.ask(yes_no).await, Answer::Yes);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn queue_interviewer_expected_fifo_then_skipped() {
        let interviewer = QueueInterviewer::new([
            Answer::Selected("N".to_string()),
            Answer::Yes,
        ]);
        assert_eq!(
            interviewer.ask(sample_question()).await,
            Answer::Selected("N".to_string())
        );
        assert_eq!(interviewer.ask(sample_question()).await, Answer::Yes);
        assert_eq!(interviewer.ask(sample_question()).await, Answer::Skipped);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn callback_interviewer_expected_delegation() {
        let interviewer = CallbackInterviewer::new(|question| {
            Answer::Selected(question.choices.last().expect("choices").key.clone())
        });
        assert_eq!(
            interviewer.ask(sample_question()).await,
            Answer::Selected("N".to_string())
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn recording_interviewer_expected_pairs_appended() {
        let recorder = RecordingInterviewer::new(Arc::new(AutoApproveInterviewer));
        recorder.ask(sample_question()).await;
        recorder.ask(sample_question()).await;

        let recordings = recorder.recordings();
        assert_eq!(recordings.len(), 2);
        assert_eq!(recordings[0].0.stage, "gate");
        assert_eq!(recordings[0].1, Answer::Selected("Y".to_string()));
    }
}
