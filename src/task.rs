use serde::{Deserialize, Serialize};

/// Sample input and output shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
  pub input: String,
  pub output: String,
}

/// Hidden test case: stdin payload and the output expected after trimming
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
  pub input: String,
  pub expected_output: String,
}

/// A named programming exercise
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
  pub name: String,
  pub description: String,
  pub input: String,
  pub output: String,
  #[serde(default)]
  pub examples: Vec<Example>,
  #[serde(default)]
  pub test_cases: Vec<TestCase>,
}

impl TestCase {
  pub fn new<IS: Into<String>, OS: Into<String>>(input: IS, expected_output: OS) -> Self {
    TestCase {
      input: input.into(),
      expected_output: expected_output.into(),
    }
  }
}

impl Task {
  pub fn new<NS: Into<String>>(name: NS) -> Self {
    Task {
      name: name.into(),
      description: String::new(),
      input: String::new(),
      output: String::new(),
      examples: vec![],
      test_cases: vec![],
    }
  }

  pub fn test_case(mut self, test_case: TestCase) -> Self {
    self.test_cases.push(test_case);
    self
  }

  pub fn example<IS: Into<String>, OS: Into<String>>(mut self, input: IS, output: OS) -> Self {
    self.examples.push(Example {
      input: input.into(),
      output: output.into(),
    });
    self
  }
}
