//! Task preambles and default output examples.
//!
//! Each preamble has an `{example}` slot for the JSON shape the model must
//! answer with and a `{feedback}` slot for learned guidance.

use serde_json::{json, Value};

use super::gateway::TaskKind;

const FIND_TARGET: &str = "You are part of an automated UI navigation system. You will see a screenshot of the current screen and a description of a UI element. Identify the element as a single visible word (the target) and, if the word is not unique on the screen, a sequence of single-word anchors that disambiguate it.

Available anchor relations are 'below' (target below anchor), 'above' (target above anchor), 'left' (target left of anchor) and 'right' (target right of anchor). The first anchor's position becomes the reference for subsequent anchors.

Respond as JSON in the following format:
```json
{example}
```

{feedback}";

const VERIFY_STATE: &str = "You are part of an automated UI navigation system. You will see a screenshot of the current screen followed by the possible states the screen can be in, each with a description and optionally example screenshots. Decide which possible state the observed screen is in and describe what you see.

Answer with the exact id of one of the possible states.

Respond as JSON in the following format:
```json
{example}
```

{feedback}";

const CLASSIFY_STATE: &str = "You are part of an automated UI navigation system. You will be given a list of possible states with their ids and descriptions, followed by a screenshot of the current screen. Classify the screen into exactly one of the possible states.

Answer with the exact id of one of the possible states and a short description of the observed screen.

Respond as JSON in the following format:
```json
{example}
```

{feedback}";

const ANSWER: &str = "You are part of an automated UI navigation system. You will see a screenshot of the current screen and a question about it. Answer the question based only on what is visible on the screen.

Respond as JSON in the following format:
```json
{example}
```

{feedback}";

const WRITE_ACTION_STRING: &str = "You are part of an automated UI navigation system. You will see a screenshot of the current screen and an instruction. Write one action that carries out the instruction.

Available actions are:
LeftClick, RightClick, DoubleClick, SendKeys, PressKeys, PasteText, ActivateWindow, CloseWindow, MaximizeWindow, MinimizeWindow, Scroll, NoAction

Use them like this:
LeftClick(target=\"OK\").below(\"Question\").left(\"Cancel\").do()
SendKeys(keys=\"Hello\").do()
PressKeys(keys=\"Alt+F4\").do()
ActivateWindow(window_name=\"Calculator\").do()
Scroll(clicks=-3).do()

Respond as JSON in the following format:
```json
{example}
```

{feedback}";

const COURSE_CORRECTION: &str = "You are working as part of an automated UI navigation system. The user will tell you the current goal of the system and show you the current screen. You should return one action that would help the system get closer to the goal, along with an action comment, an observation and an interrupt_process flag. You will then see the next screenshot and have a chance to perform further actions.

You can use actions and anchors to reach the goal. Available actions are:
LeftClick, DoubleClick, SendKeys, PressKeys, ActivateWindow, CloseWindow, NoAction

Use them like this:
LeftClick(target=\"OK\").below(\"Question\").left(\"Cancel\").do()
DoubleClick(target=\"starten\").right(\"Suche\").do()
SendKeys(keys=\"Hello\").do()
PressKeys(keys=\"Alt+F4\").do()
ActivateWindow(window_name=\"Calculator\").do()
CloseWindow(window_name=\"Calculator\").do()
NoAction().do()

Set the 'interrupt_process' flag to true if the goal cannot be reached due to some critical condition (e.g. process data is invalid). Use this sparingly, because it will interrupt the processing of the task. Your comments in 'observation' will be passed to the user.

Respond as JSON in the following format:
```json
{example}
```

{feedback}";

const TARGETING_FEEDBACK: &str = "Here is what you have learnt to get this right:
- All targets and anchors must be *single words* visible on the screen.
- Every target must be unique on the screen. If multiple instances are present, use anchors to uniquely specify the right target.";

const STATE_FEEDBACK: &str = "Here is what you have learnt to get this right:
- Only answer with an id from the list of possible states.
- Dialogs and pop-ups in front of the main window determine the state.
- A spinner, progress bar or blank window that is still rendering means the screen is loading.";

const ACTION_FEEDBACK: &str = "Here is what you have learnt to get this right:
- Available anchors are 'below' (target below anchor), 'above' (target above anchor), 'left' (target left of anchor), 'right' (target right of anchor). You can use any anchor sequence, but the first anchor will apply to subsequent ones.
- All targets and anchors must be *single words* visible on the screen AND present in the screen text. You can get creative in chaining together different one-word anchors.
- Every target must be unique on the screen. If multiple instances are present, use anchors to uniquely specify the right target.
- Use ActivateWindow() to put the window in focus if it is not already. For ActivateWindow and CloseWindow, window names must match exactly, one to one, including special characters. You can also use wildcards.
- If the action you suggest does not work, try a different action, different target or different anchor combinations.
- Clicking 'X' typically does not work for closing windows. Use CloseWindow() or PressKeys(keys=\"ESC\") instead.";

const CUSTOM_INSTRUCTIONS: &str = "You have learned this about the system:\n{instructions}";

fn preamble(task: TaskKind) -> &'static str {
    match task {
        TaskKind::FindTarget => FIND_TARGET,
        TaskKind::VerifyState => VERIFY_STATE,
        TaskKind::ClassifyState => CLASSIFY_STATE,
        TaskKind::Answer => ANSWER,
        TaskKind::WriteActionString => WRITE_ACTION_STRING,
        TaskKind::CourseCorrection => COURSE_CORRECTION,
    }
}

/// Learned guidance for the built-in output shape of `task`.
pub fn default_feedback(task: TaskKind) -> &'static str {
    match task {
        TaskKind::FindTarget => TARGETING_FEEDBACK,
        TaskKind::VerifyState | TaskKind::ClassifyState => STATE_FEEDBACK,
        TaskKind::Answer => "",
        TaskKind::WriteActionString | TaskKind::CourseCorrection => ACTION_FEEDBACK,
    }
}

/// Example of the built-in output shape of `task`.
pub fn default_example(task: TaskKind) -> Value {
    match task {
        TaskKind::FindTarget => json!({
            "target": "OK",
            "anchors": [{"relation": "below", "value": "Question"}]
        }),
        TaskKind::VerifyState | TaskKind::ClassifyState => json!({
            "id": "main_window",
            "description": "The main window is open and no dialog is shown"
        }),
        TaskKind::Answer => json!({"answer": "42"}),
        TaskKind::WriteActionString => json!({"action_string": "LeftClick(target='OK').do()"}),
        TaskKind::CourseCorrection => json!({
            "action_string": "LeftClick(target='OK').do()",
            "action_comment": "Click the OK button to close the dialog",
            "observation": "Payment terms have changed according to a warning dialog",
            "interrupt_process": false
        }),
    }
}

/// Fill the preamble of `task` with a pretty-printed example and feedback.
pub fn system_prompt(task: TaskKind, example: &Value, feedback: &str) -> String {
    let example = serde_json::to_string_pretty(example).unwrap_or_else(|_| example.to_string());
    preamble(task)
        .replace("{example}", &example)
        .replace("{feedback}", feedback)
        .trim_end()
        .to_string()
}

pub fn custom_instructions(instructions: &str) -> String {
    CUSTOM_INSTRUCTIONS.replace("{instructions}", instructions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_fills_both_slots() {
        let prompt = system_prompt(
            TaskKind::ClassifyState,
            &default_example(TaskKind::ClassifyState),
            "remember this",
        );
        assert!(prompt.contains("\"id\": \"main_window\""));
        assert!(prompt.ends_with("remember this"));
        assert!(!prompt.contains("{example}"));
        assert!(!prompt.contains("{feedback}"));
    }

    #[test]
    fn empty_feedback_leaves_no_trailing_whitespace() {
        let prompt = system_prompt(TaskKind::Answer, &json!({"answer": ""}), "");
        assert!(prompt.ends_with("```"));
    }
}
