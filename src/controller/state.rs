//! Button and stick state shared between the embedding application and the
//! input report emitter.
//!
//! The application owns the only [`ButtonHandle`]; the emitter holds a
//! `watch::Receiver` and copies the whole state out on every tick, so a
//! report never mixes fields from two different updates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dpad {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
}

/// Normalized stick deflection, `-1.0..=1.0` on both axes, positive Y is up
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StickPosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ButtonState {
    pub dpad: Dpad,
    pub a: bool,
    pub b: bool,
    pub x: bool,
    pub y: bool,
    pub r: bool,
    pub zr: bool,
    pub l: bool,
    pub zl: bool,
    pub home: bool,
    pub plus: bool,
    pub minus: bool,
    pub capture: bool,
    pub left_stick: StickPosition,
    pub right_stick: StickPosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Button {
    Up,
    Down,
    Left,
    Right,
    A,
    B,
    X,
    Y,
    R,
    ZR,
    L,
    ZL,
    Home,
    Plus,
    Minus,
    Capture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stick {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown input name: {0}")]
pub struct UnknownInput(pub String);

impl FromStr for Button {
    type Err = UnknownInput;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let button = match s.to_ascii_lowercase().as_str() {
            "up" => Button::Up,
            "down" => Button::Down,
            "left" => Button::Left,
            "right" => Button::Right,
            "a" => Button::A,
            "b" => Button::B,
            "x" => Button::X,
            "y" => Button::Y,
            "r" => Button::R,
            "zr" => Button::ZR,
            "l" => Button::L,
            "zl" => Button::ZL,
            "home" => Button::Home,
            "plus" | "+" => Button::Plus,
            "minus" | "-" => Button::Minus,
            "capture" => Button::Capture,
            _ => return Err(UnknownInput(s.to_string())),
        };
        Ok(button)
    }
}

impl FromStr for Stick {
    type Err = UnknownInput;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "left" | "l" => Ok(Stick::Left),
            "right" | "r" => Ok(Stick::Right),
            _ => Err(UnknownInput(s.to_string())),
        }
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl ButtonState {
    pub fn set(&mut self, button: Button, pressed: bool) {
        let slot = match button {
            Button::Up => &mut self.dpad.up,
            Button::Down => &mut self.dpad.down,
            Button::Left => &mut self.dpad.left,
            Button::Right => &mut self.dpad.right,
            Button::A => &mut self.a,
            Button::B => &mut self.b,
            Button::X => &mut self.x,
            Button::Y => &mut self.y,
            Button::R => &mut self.r,
            Button::ZR => &mut self.zr,
            Button::L => &mut self.l,
            Button::ZL => &mut self.zl,
            Button::Home => &mut self.home,
            Button::Plus => &mut self.plus,
            Button::Minus => &mut self.minus,
            Button::Capture => &mut self.capture,
        };
        *slot = pressed;
    }

    pub fn stick_mut(&mut self, stick: Stick) -> &mut StickPosition {
        match stick {
            Stick::Left => &mut self.left_stick,
            Stick::Right => &mut self.right_stick,
        }
    }
}

/// Application-facing mutation handle. Last write wins; the next emitter
/// tick reports whatever is current.
#[derive(Debug, Clone)]
pub struct ButtonHandle {
    sender: Arc<watch::Sender<ButtonState>>,
}

impl Default for ButtonHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ButtonHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(ButtonState::default());
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ButtonState> {
        self.sender.subscribe()
    }

    pub fn update<F: FnOnce(&mut ButtonState)>(&self, f: F) {
        self.sender.send_modify(f);
    }

    pub fn set(&self, button: Button, pressed: bool) {
        debug!("{} {}", button, if pressed { "pressed" } else { "released" });
        self.update(|state| state.set(button, pressed));
    }

    pub fn press(&self, button: Button) {
        self.set(button, true);
    }

    pub fn release(&self, button: Button) {
        self.set(button, false);
    }

    pub fn set_stick(&self, stick: Stick, x: f64, y: f64) {
        self.update(|state| *state.stick_mut(stick) = StickPosition { x, y });
    }

    /// Releases every button and centres both sticks
    pub fn reset(&self) {
        self.sender.send_replace(ButtonState::default());
    }

    pub fn snapshot(&self) -> ButtonState {
        *self.sender.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_buttons() {
        assert_eq!("ZR".parse::<Button>().unwrap(), Button::ZR);
        assert_eq!("home".parse::<Button>().unwrap(), Button::Home);
        assert_eq!("+".parse::<Button>().unwrap(), Button::Plus);
        assert!("turbo".parse::<Button>().is_err());
    }

    #[test]
    fn parse_sticks() {
        assert_eq!("left".parse::<Stick>().unwrap(), Stick::Left);
        assert_eq!("R".parse::<Stick>().unwrap(), Stick::Right);
        assert!("middle".parse::<Stick>().is_err());
    }

    #[test]
    fn handle_updates_are_visible_to_subscribers() {
        let handle = ButtonHandle::new();
        let receiver = handle.subscribe();

        handle.press(Button::Left);
        handle.press(Button::A);
        handle.set_stick(Stick::Right, 0.5, -0.25);

        let state = *receiver.borrow();
        assert!(state.dpad.left);
        assert!(state.a);
        assert_eq!(state.right_stick, StickPosition { x: 0.5, y: -0.25 });

        handle.release(Button::Left);
        assert!(!handle.snapshot().dpad.left);

        handle.reset();
        assert_eq!(handle.snapshot(), ButtonState::default());
    }
}
