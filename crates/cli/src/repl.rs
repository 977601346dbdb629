use std::io::{self, Write};
use std::time::Duration;

use rustyline::error::ReadlineError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use worm_core::io::input::{self, InputSender};
use worm_core::io::output::{OutputKind, OutputMessage, OutputReceiver};

const PROMPT: &str = "You> ";

/// Line-oriented front end. A blocking rustyline thread reads one line per
/// prompt request; the next prompt is requested once the runtime publishes a
/// turn-ending message, so replies never interleave with typing.
pub async fn run(
    input_tx: InputSender,
    mut output_rx: OutputReceiver,
    token: CancellationToken,
) -> anyhow::Result<()> {
    const SPINNER: [&str; 4] = ["-", "\\", "|", "/"];

    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<InputEvent>();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();
    spawn_input_thread(line_tx, ready_rx);

    // first prompt goes out after the greeting
    let mut greeted = false;
    let mut closing = false;
    let mut waiting_for_reply = false;
    let mut spinner_idx: usize = 0;
    let mut spinner_interval = tokio::time::interval(Duration::from_millis(100));
    spinner_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                break;
            }
            _ = spinner_interval.tick(), if waiting_for_reply => {
                spinner_idx = (spinner_idx + 1) % SPINNER.len();
                draw_thinking_frame(SPINNER[spinner_idx])?;
            }
            line = line_rx.recv(), if !closing => {
                let Some(line) = line else {
                    closing = true;
                    continue;
                };
                match line {
                    InputEvent::Line(line) => {
                        let text = line.trim();
                        if text.is_empty() {
                            request_next_prompt(&ready_tx);
                            continue;
                        }
                        if input::submit_text(&input_tx, text.to_owned()).await.is_err() {
                            break;
                        }
                        if !waiting_for_reply {
                            spinner_idx = 0;
                            draw_thinking_frame(SPINNER[spinner_idx])?;
                            waiting_for_reply = true;
                        }
                    }
                    InputEvent::Interrupted => {
                        token.cancel();
                        break;
                    }
                    InputEvent::Eof => {
                        // say goodbye properly; the runtime ends the session
                        closing = true;
                        if input::submit_text(&input_tx, "quit").await.is_err() {
                            break;
                        }
                    }
                    InputEvent::Error(err) => {
                        eprintln!("input error: {err}");
                        token.cancel();
                        break;
                    }
                }
            }
            msg = output_rx.recv() => {
                let Some(msg) = msg else {
                    break;
                };
                if waiting_for_reply && msg.ends_turn {
                    waiting_for_reply = false;
                }
                clear_current_line()?;
                print_message(&msg);
                if (msg.ends_turn || !greeted) && !closing {
                    request_next_prompt(&ready_tx);
                }
                greeted = true;
            }
        }
    }
    drop(ready_tx);

    if waiting_for_reply {
        clear_current_line()?;
    }
    println!();
    Ok(())
}

fn print_message(msg: &OutputMessage) {
    if msg.content.is_empty() {
        return;
    }
    match msg.kind {
        OutputKind::Reply => println!("Worm> {}", msg.content),
        OutputKind::Notice => println!("{}", msg.content),
    }
}

fn draw_thinking_frame(frame: &str) -> anyhow::Result<()> {
    print!("\rthinking... {frame}");
    io::stdout().flush()?;
    Ok(())
}

fn clear_current_line() -> anyhow::Result<()> {
    print!("\r\x1b[2K");
    io::stdout().flush()?;
    Ok(())
}

fn request_next_prompt(ready_tx: &std::sync::mpsc::Sender<()>) {
    let _ = ready_tx.send(());
}

fn spawn_input_thread(
    line_tx: mpsc::UnboundedSender<InputEvent>,
    ready_rx: std::sync::mpsc::Receiver<()>,
) {
    std::thread::spawn(move || {
        let mut editor = match rustyline::DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                let _ = line_tx.send(InputEvent::Error(e.to_string()));
                return;
            }
        };

        while ready_rx.recv().is_ok() {
            match editor.readline(PROMPT) {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        let _ = editor.add_history_entry(line.as_str());
                    }
                    if line_tx.send(InputEvent::Line(line)).is_err() {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    let _ = line_tx.send(InputEvent::Interrupted);
                    break;
                }
                Err(ReadlineError::Eof) => {
                    let _ = line_tx.send(InputEvent::Eof);
                    break;
                }
                Err(e) => {
                    let _ = line_tx.send(InputEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    });
}

enum InputEvent {
    Line(String),
    Interrupted,
    Eof,
    Error(String),
}
